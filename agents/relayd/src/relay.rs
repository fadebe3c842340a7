use std::sync::Arc;

use eyre::{Result, WrapErr};
use futures_util::future::join_all;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use txrelay_base::{
    db::{RelayRocksDB, DB},
    sync::{ChainSyncer, SyncFilter},
    RelayMetrics, RelaySettings, Server,
};
use txrelay_core::{ChainInterface, FeeEscalator, TransactionSigner};
use txrelay_ethereum::{EthereumChain, EthereumSigner};

use crate::{spawn_signal_handler, Dispatcher, Retrier, SessionController, StateFilter};

/// The assembled daemon: session controller in front, syncer behind.
#[derive(Debug)]
pub struct Relayd {
    settings: RelaySettings,
    chain: Arc<dyn ChainInterface>,
    signer: Option<Arc<dyn TransactionSigner>>,
    db: Arc<RelayRocksDB>,
    metrics: Arc<RelayMetrics>,
}

impl Relayd {
    /// The agent name
    pub const AGENT_NAME: &'static str = "relayd";

    /// Build the daemon from its settings: open the database and connect to
    /// the configured node.
    pub fn from_settings(settings: RelaySettings) -> Result<Self> {
        let db = DB::from_path(&settings.db.0)
            .wrap_err_with(|| format!("Failed to open database at {:?}", settings.db.0))?;
        let chain = EthereumChain::new(&settings.chain.rpc_url)?;
        let signer = match &settings.signer {
            Some(conf) => {
                let signer = EthereumSigner::new(&conf.key, settings.chain.chain_id)?;
                info!(address = ?signer.address(), "Loaded signer");
                Some(Arc::new(signer) as Arc<dyn TransactionSigner>)
            }
            None => None,
        };
        let metrics = Arc::new(RelayMetrics::new(Registry::new())?);
        Ok(Self::new(
            settings,
            Arc::new(chain),
            signer,
            Arc::new(RelayRocksDB::new(db)),
            metrics,
        ))
    }

    /// Assemble from already built parts
    pub fn new(
        settings: RelaySettings,
        chain: Arc<dyn ChainInterface>,
        signer: Option<Arc<dyn TransactionSigner>>,
        db: Arc<RelayRocksDB>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            settings,
            chain,
            signer,
            db,
            metrics,
        }
    }

    /// The session controller this daemon runs
    pub fn controller(&self, cancel: CancellationToken) -> Result<SessionController> {
        let dispatcher = Dispatcher::new(
            self.chain.clone(),
            self.db.clone(),
            self.settings.dispatch.inflight_limit,
            self.settings.dispatch.batch_limit,
            self.settings.retry.error_threshold(),
            self.metrics.clone(),
        );
        let retrier = match (&self.signer, self.settings.retry.enabled) {
            (Some(signer), true) => Some(Retrier::new(
                self.chain.clone(),
                self.db.clone(),
                signer.clone(),
                FeeEscalator::new(self.settings.retry.fee_escalation_factor)?,
                self.settings.retry.pending_threshold(),
                self.metrics.clone(),
            )),
            (None, true) => {
                warn!("No signer configured, stuck transactions will not be replaced");
                None
            }
            (_, false) => None,
        };
        Ok(SessionController::new(
            self.settings.session.clone(),
            self.chain.clone(),
            self.db.clone(),
            dispatcher,
            retrier,
            self.metrics.clone(),
            cancel,
        ))
    }

    /// The syncer feeding the state filter
    pub fn syncer(&self, cancel: CancellationToken) -> ChainSyncer {
        let state_filter = StateFilter::new(self.db.clone(), self.metrics.clone());
        ChainSyncer::new(
            self.chain.clone(),
            self.db.clone(),
            vec![Arc::new(state_filter) as Arc<dyn SyncFilter>],
            self.settings.sync.interval(),
            self.metrics.clone(),
            cancel,
        )
    }

    /// Run until SIGINT/SIGTERM or a fatal controller error.
    pub async fn run(self) -> Result<()> {
        let cancel = CancellationToken::new();

        if let Some(port) = self.settings.metrics_port {
            Arc::new(Server::new(port, self.metrics.clone())).run();
        }

        let mut sync_tasks = vec![];
        if self.settings.sync.enabled {
            let syncer = Arc::new(self.syncer(cancel.clone()));
            let cursors = syncer
                .prepare_cursors(self.settings.sync.history_start, self.settings.sync.skip_history)
                .await
                .wrap_err("Failed to prepare sync cursors")?;
            sync_tasks = syncer.spawn(cursors);
        } else {
            info!("Syncer disabled");
        }

        let mut controller = self.controller(cancel.clone())?;
        let signals = spawn_signal_handler(controller.shutdown_handle())?;
        let span = info_span!("session", path = ?controller.socket_path());
        let result = controller.run().instrument(span).await;

        cancel.cancel();
        signals.abort();
        for joined in join_all(sync_tasks).await {
            match joined {
                Ok(Ok(cursor)) => info!(id = cursor.id, height = cursor.current_height, "Syncer stopped"),
                Ok(Err(err)) => error!(?err, "Syncer failed"),
                Err(err) => error!(?err, "Syncer task panicked"),
            }
        }
        info!(agent = Self::AGENT_NAME, "Shut down");
        Ok(result?)
    }
}
