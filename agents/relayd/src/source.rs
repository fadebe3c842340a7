use std::{fmt::Debug, fs, path::Path};

use eyre::{bail, Result, WrapErr};

use txrelay_core::serialize::decode_hex;

/// A way of turning a command line argument into signed transactions.
///
/// Sources are tried in order, the first one that recognises the input
/// wins.
pub trait TxSource: Debug {
    /// Name used in error messages
    fn name(&self) -> &str;

    /// `None` if the input is not meant for this source
    fn load(&self, input: &str) -> Result<Option<Vec<Vec<u8>>>>;
}

/// The argument itself is a hex encoded transaction.
#[derive(Debug, Default)]
pub struct HexArgumentSource;

impl TxSource for HexArgumentSource {
    fn name(&self) -> &str {
        "hex"
    }

    fn load(&self, input: &str) -> Result<Option<Vec<Vec<u8>>>> {
        match decode_hex(input) {
            Ok(raw) if !raw.is_empty() => Ok(Some(vec![raw])),
            _ => Ok(None),
        }
    }
}

/// The argument names a file with one hex transaction per line. Blank lines
/// and lines starting with `#` are skipped.
#[derive(Debug, Default)]
pub struct FileLinesSource;

impl TxSource for FileLinesSource {
    fn name(&self) -> &str {
        "file"
    }

    fn load(&self, input: &str) -> Result<Option<Vec<Vec<u8>>>> {
        let path = Path::new(input);
        if !path.is_file() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(path).wrap_err_with(|| format!("Failed to read {path:?}"))?;
        let mut txs = vec![];
        for (number, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let raw = decode_hex(line)
                .wrap_err_with(|| format!("{path:?} line {}: not a hex transaction", number + 1))?;
            txs.push(raw);
        }
        Ok(Some(txs))
    }
}

/// The default source list
pub fn default_sources() -> Vec<Box<dyn TxSource>> {
    vec![Box::new(HexArgumentSource), Box::new(FileLinesSource)]
}

/// Load `input` with the first source that recognises it.
pub fn load_transactions(sources: &[Box<dyn TxSource>], input: &str) -> Result<Vec<Vec<u8>>> {
    for source in sources {
        if let Some(txs) = source.load(input)? {
            return Ok(txs);
        }
    }
    let tried = sources.iter().map(|source| source.name()).collect::<Vec<_>>();
    bail!("{input:?} is neither a hex transaction nor a readable file (tried {tried:?})")
}
