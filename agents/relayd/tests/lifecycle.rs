//! End to end scenarios against the in-memory chain.

use std::{path::PathBuf, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use relayd::{ClientError, Dispatcher, Relayd, SessionState, SocketClient};
use txrelay_base::{
    db::{QueueStore, RelayRocksDB, DB},
    sync::ChainSyncer,
    RelayMetrics, RelaySettings,
};
use txrelay_core::{
    serialize::to_hex, ChainInterface, QueuedTransaction, StatusFlag, TransactionSigner, H160,
    U256,
};
use txrelay_test::{FakeTransaction, MockChain, MockSigner};

const SENDER: H160 = H160([0x55; 20]);

struct Harness {
    dir: tempfile::TempDir,
    db: Arc<RelayRocksDB>,
    chain: Arc<MockChain>,
    metrics: Arc<RelayMetrics>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = DB::from_path(&dir.path().join("db")).unwrap();
        Self {
            db: Arc::new(RelayRocksDB::new(db)),
            dir,
            chain: Arc::new(MockChain::new()),
            metrics: Arc::new(RelayMetrics::dummy().unwrap()),
        }
    }

    fn settings(&self) -> RelaySettings {
        let mut settings = RelaySettings::default();
        settings.session.socket_path = Some(self.socket_path());
        settings.session.dispatch_delay = 0.05;
        settings.session.busy_delay = 0.01;
        settings.session.max_dispatch_delay = 0.05;
        settings.session.client_timeout = 1.0;
        settings.session.max_message_size = 4096;
        settings.dispatch.inflight_limit = 1;
        settings.sync.interval = 0.01;
        settings
    }

    fn socket_path(&self) -> PathBuf {
        self.dir.path().join("run").join("relayd.sock")
    }

    fn relayd(&self, settings: RelaySettings) -> Relayd {
        let signer: Arc<dyn TransactionSigner> = Arc::new(MockSigner::new(SENDER));
        Relayd::new(
            settings,
            self.chain.clone(),
            Some(signer),
            self.db.clone(),
            self.metrics.clone(),
        )
    }

    fn dispatcher(&self, limit: usize) -> Dispatcher {
        Dispatcher::new(
            self.chain.clone(),
            self.db.clone(),
            limit,
            None,
            Duration::from_secs(60),
            self.metrics.clone(),
        )
    }

    async fn queue(&self, fake: &FakeTransaction) -> QueuedTransaction {
        let tx = QueuedTransaction::new(fake.decoded(), Utc::now());
        self.db.create(&tx).await.unwrap();
        tx
    }

    async fn get(&self, tx: &QueuedTransaction) -> QueuedTransaction {
        self.db.retrieve(&tx.hash).await.unwrap().unwrap()
    }

    /// Mine a block and run the relay's syncer filters over it
    async fn mine_and_sync(&self, relayd: &Relayd) {
        let height = self.chain.mine_block();
        let block = self.chain.block_by_number(height).await.unwrap().unwrap();
        relayd
            .syncer(CancellationToken::new())
            .process_block(&block)
            .await
            .unwrap();
    }

    fn finalized_count(&self) -> u64 {
        self.metrics
            .transactions_finalized
            .with_label_values(&["final"])
            .get()
    }
}

async fn wait_for_socket(path: &PathBuf) {
    for _ in 0..500 {
        if path.exists() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("socket {path:?} never appeared");
}

#[tokio::test]
#[tracing_test::traced_test]
async fn admission_is_idempotent_and_dispatches_in_the_background() {
    let harness = Harness::new();
    let relayd = harness.relayd(harness.settings());
    let mut controller = relayd.controller(CancellationToken::new()).unwrap();
    let shutdown = controller.shutdown_handle();
    let task = tokio::spawn(async move {
        let result = controller.run().await;
        (result, controller.state())
    });
    wait_for_socket(&harness.socket_path()).await;

    let fake = FakeTransaction::new(SENDER, 0, 100);
    let client = SocketClient::new(harness.socket_path());
    let hash = client.submit(&fake.encode()).await.unwrap();
    assert_eq!(hash, fake.hash());

    let second = client.submit(&fake.encode()).await;
    assert!(matches!(second, Err(ClientError::Rejected(1))));
    assert_eq!(
        harness
            .db
            .siblings(&SENDER, 0)
            .await
            .unwrap()
            .len(),
        1
    );

    for _ in 0..500 {
        if harness.chain.submissions() == vec![hash] {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(harness.chain.submissions(), vec![hash]);

    shutdown.shutdown();
    shutdown.shutdown();
    let (result, state) = task.await.unwrap();
    result.unwrap();
    assert_eq!(state, SessionState::ShuttingDown);
    assert!(!harness.socket_path().exists());
}

#[tokio::test]
async fn rejected_request_allows_one_more_on_the_same_connection() {
    let harness = Harness::new();
    let mut settings = harness.settings();
    settings.session.dispatch_delay = 5.0;
    settings.session.max_dispatch_delay = 5.0;
    let relayd = harness.relayd(settings);
    let mut controller = relayd.controller(CancellationToken::new()).unwrap();
    let shutdown = controller.shutdown_handle();
    let task = tokio::spawn(async move { controller.run().await });
    wait_for_socket(&harness.socket_path()).await;

    let mut stream = UnixStream::connect(harness.socket_path()).await.unwrap();
    stream.write_all(b"not hex at all\n").await.unwrap();
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(u32::from_be_bytes(header), 1);

    let fake = FakeTransaction::new(SENDER, 3, 100);
    let request = format!("{}\n", to_hex(&fake.encode()));
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = vec![];
    stream.read_to_end(&mut response).await.unwrap();
    assert_eq!(&response[..4], &[0, 0, 0, 0]);
    assert_eq!(
        std::str::from_utf8(&response[4..]).unwrap(),
        hex::encode(fake.hash().as_bytes())
    );

    shutdown.shutdown();
    task.await.unwrap().unwrap();
}

#[tokio::test]
#[tracing_test::traced_test]
async fn vanished_socket_stops_the_controller() {
    let harness = Harness::new();
    let relayd = harness.relayd(harness.settings());
    let mut controller = relayd.controller(CancellationToken::new()).unwrap();
    let task = tokio::spawn(async move { controller.run().await });
    wait_for_socket(&harness.socket_path()).await;

    std::fs::remove_file(harness.socket_path()).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(relayd::RelayError::SocketState(_))));
}

#[tokio::test]
async fn finalization_frees_the_sender_budget() {
    let harness = Harness::new();
    let relayd = harness.relayd(harness.settings());
    let dispatcher = harness.dispatcher(1);

    let tx1 = harness.queue(&FakeTransaction::new(SENDER, 0, 100)).await;
    let next = harness.queue(&FakeTransaction::new(SENDER, 1, 100)).await;

    assert_eq!(dispatcher.process(Utc::now()).await.unwrap(), 1);
    assert!(harness.get(&tx1).await.status.has(StatusFlag::InNetwork));
    // at the limit
    assert_eq!(dispatcher.process(Utc::now()).await.unwrap(), 0);
    assert!(harness.get(&next).await.status.has(StatusFlag::Queued));

    harness.mine_and_sync(&relayd).await;
    let confirmed = harness.get(&tx1).await;
    assert!(confirmed.status.has(StatusFlag::Final));
    assert!(confirmed.confirmation.is_some());

    assert_eq!(dispatcher.process(Utc::now()).await.unwrap(), 1);
    assert!(harness.get(&next).await.status.has(StatusFlag::InNetwork));
    assert_eq!(harness.chain.submissions(), vec![tx1.hash, next.hash]);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn stuck_transaction_is_replaced_and_the_replacement_confirms() {
    let harness = Harness::new();
    let relayd = harness.relayd(harness.settings());
    let dispatcher = harness.dispatcher(1);
    harness.chain.set_gas_price(90);

    let tx2 = harness.queue(&FakeTransaction::new(SENDER, 5, 100)).await;
    assert_eq!(dispatcher.process(Utc::now()).await.unwrap(), 1);

    let retrier = retrier(&harness);
    let later = Utc::now() + chrono::Duration::seconds(1);
    assert_eq!(retrier.process(later).await.unwrap(), 1);

    let stale = harness.get(&tx2).await;
    assert!(stale.status.has(StatusFlag::Obsolete));
    let replacement = harness
        .db
        .retrieve(&stale.superseded_by.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replacement.fee, U256::from(110u64));
    assert_eq!(replacement.nonce, 5);
    assert_eq!(replacement.sender, SENDER);
    assert!(replacement.status.has(StatusFlag::Queued));

    // the superseded entry no longer counts against the budget
    assert_eq!(dispatcher.process(later).await.unwrap(), 1);
    harness.mine_and_sync(&relayd).await;
    let replacement = harness.get(&replacement).await;
    assert!(replacement.status.has(StatusFlag::Final));
    assert!(harness.get(&tx2).await.confirmation.is_none());
}

/// A retrier that considers everything submitted before now stuck
fn retrier(harness: &Harness) -> relayd::Retrier {
    relayd::Retrier::new(
        harness.chain.clone(),
        harness.db.clone(),
        Arc::new(MockSigner::new(SENDER)),
        txrelay_core::FeeEscalator::new(1.1).unwrap(),
        Duration::from_secs(0),
        harness.metrics.clone(),
    )
}

#[tokio::test]
async fn replaying_a_block_does_not_finalize_twice() {
    let harness = Harness::new();
    let relayd = harness.relayd(harness.settings());
    let tx = harness.queue(&FakeTransaction::new(SENDER, 0, 100)).await;
    harness.dispatcher(1).process(Utc::now()).await.unwrap();

    let height = harness.chain.mine_block();
    let block = harness.chain.block_by_number(height).await.unwrap().unwrap();
    let syncer = relayd.syncer(CancellationToken::new());
    syncer.process_block(&block).await.unwrap();
    let first = harness.get(&tx).await;
    syncer.process_block(&block).await.unwrap();

    assert_eq!(harness.get(&tx).await, first);
    assert_eq!(harness.finalized_count(), 1);
}

#[tokio::test]
async fn restarted_syncer_resumes_without_gaps() {
    let harness = Harness::new();
    let relayd = harness.relayd(harness.settings());
    let dispatcher = harness.dispatcher(10);

    // block 1 is mined before the first run
    let early = harness.queue(&FakeTransaction::new(SENDER, 0, 100)).await;
    dispatcher.process(Utc::now()).await.unwrap();
    harness.chain.mine_block();

    let cancel = CancellationToken::new();
    let syncer: Arc<ChainSyncer> = Arc::new(relayd.syncer(cancel.clone()));
    let cursors = syncer.prepare_cursors(0, false).await.unwrap();
    assert_eq!(cursors.len(), 2);
    let handles = syncer.spawn(cursors);
    for _ in 0..500 {
        if harness.get(&early).await.status.has(StatusFlag::Final) {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(harness.get(&early).await.status.has(StatusFlag::Final));
    cancel.cancel();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // mined while the relay was down
    let late = harness.queue(&FakeTransaction::new(SENDER, 1, 100)).await;
    dispatcher.process(Utc::now()).await.unwrap();
    harness.chain.mine_block();

    let cancel = CancellationToken::new();
    let syncer = Arc::new(relayd.syncer(cancel.clone()));
    let cursors = syncer.prepare_cursors(0, false).await.unwrap();
    let handles = syncer.spawn(cursors);
    for _ in 0..500 {
        if harness.get(&late).await.status.has(StatusFlag::Final) {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(harness.get(&late).await.status.has(StatusFlag::Final));
    cancel.cancel();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(harness.finalized_count(), 2);
}
