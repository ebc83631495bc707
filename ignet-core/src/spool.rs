//! Spool directory layout and the filesystem steps of a transfer. Several
//! server processes may share these directories, so coordination relies on
//! exclusive create and link-then-unlink rather than in-process locks.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolDirs {
    /// Published inbound files, consumed by room/mail processing.
    pub net_in: PathBuf,
    /// One pending outbound file per neighbor, named after the node.
    pub net_out: PathBuf,
    /// Inbound downloads in progress.
    pub tmp: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("cannot create {path}: {source}")]
    Create { path: PathBuf, source: io::Error },
    #[error("could not link {from} to {to}: {source}")]
    Link {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
    #[error("cannot open {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
}

/// Names for one inbound download: where it is written and where it lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundNames {
    pub temp: PathBuf,
    pub spool: PathBuf,
}

impl SpoolDirs {
    /// `<tmp>/<node>.<hex-time><hex-rand>` and the same name under `net_in`.
    pub fn inbound_names(&self, node: &str) -> InboundNames {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let suffix: u32 = rand::random();
        let name = format!("{}.{:x}{:x}", node, secs, suffix);
        InboundNames {
            temp: self.tmp.join(&name),
            spool: self.net_in.join(&name),
        }
    }

    /// `<net_out>/<node>`.
    pub fn outbound_path(&self, node: &str) -> PathBuf {
        self.net_out.join(node)
    }

    /// True when an outbound file for `node` exists and is readable.
    pub fn has_outbound(&self, node: &str) -> bool {
        File::open(self.outbound_path(node)).is_ok()
    }

    pub fn create_all(&self) -> io::Result<()> {
        for dir in [&self.net_in, &self.net_out, &self.tmp] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Create a download target; fails if the name is already taken.
pub fn create_exclusive(path: &Path) -> Result<File, SpoolError> {
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path).map_err(|source| SpoolError::Create {
        path: path.to_path_buf(),
        source,
    })
}

/// Outbound spool size without opening it. `None` if there is no file.
pub fn outbound_size(path: &Path) -> Result<Option<u64>, SpoolError> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.len())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(SpoolError::Open {
            path: path.to_path_buf(),
            source,
        }),
    }
}

pub fn open_outbound(path: &Path) -> Result<File, SpoolError> {
    File::open(path).map_err(|source| SpoolError::Open {
        path: path.to_path_buf(),
        source,
    })
}

/// Publish a finished download: hard link it under its spool name, then drop
/// the temp name. The temp name is removed even when linking fails.
pub fn publish(names: &InboundNames) -> Result<(), SpoolError> {
    let linked = std::fs::hard_link(&names.temp, &names.spool);
    let _ = std::fs::remove_file(&names.temp);
    linked.map_err(|source| SpoolError::Link {
        from: names.temp.clone(),
        to: names.spool.clone(),
        source,
    })
}
