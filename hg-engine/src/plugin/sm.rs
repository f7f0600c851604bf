//! Shared-memory plugin (`na+sm`).
//!
//! Same-host peers rendezvous through a Unix-domain socket in the temp
//! directory named after the instance. The instance name comes from the
//! spec host (`na+sm://<name>`) or defaults to `<pid>-<n>`. The socket file
//! is removed when the class is dropped. A leftover file is reused only if
//! nothing accepts on it; a live instance of the same name is an error.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

use super::{NaAddr, NaClass, NaContext, NaInitInfo, NaPlugin};
use crate::error::NaError;

const PROTOCOLS: &[&str] = &["sm"];

pub struct SmPlugin;

impl SmPlugin {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SmPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl NaPlugin for SmPlugin {
    fn name(&self) -> &str {
        "na"
    }

    fn protocols(&self) -> &[&str] {
        PROTOCOLS
    }

    fn initialize(&self, info: &NaInitInfo<'_>) -> Result<Box<dyn NaClass>, NaError> {
        static INSTANCE: AtomicU32 = AtomicU32::new(0);

        let name = match &info.spec.host {
            Some(host) => host.replace('/', "-"),
            None => format!(
                "{}-{}",
                std::process::id(),
                INSTANCE.fetch_add(1, Ordering::Relaxed)
            ),
        };

        let socket = if info.listen {
            let path = std::env::temp_dir().join(format!("hg-sm-{name}.sock"));
            if path.exists() {
                reclaim_stale(&path)?;
            }
            let listener = UnixListener::bind(&path)?;
            listener.set_nonblocking(true)?;
            debug!(path = %path.display(), "na+sm listening");
            Some((listener, path))
        } else {
            None
        };

        Ok(Box::new(SmClass { name, socket }))
    }
}

/// Remove a leftover socket file, unless another instance still accepts on
/// it.
fn reclaim_stale(path: &Path) -> Result<(), NaError> {
    match UnixStream::connect(path) {
        Ok(_) => Err(NaError::Io(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("sm instance already listening at {}", path.display()),
        ))),
        Err(_) => {
            debug!(path = %path.display(), "removing stale sm socket");
            std::fs::remove_file(path)?;
            Ok(())
        }
    }
}

struct SmClass {
    name: String,
    socket: Option<(UnixListener, PathBuf)>,
}

impl NaClass for SmClass {
    fn protocol(&self) -> &str {
        "sm"
    }

    fn addr_self(&self) -> Result<NaAddr, NaError> {
        Ok(NaAddr::new(format!("na+sm://{}", self.name)))
    }

    fn context_create(&self) -> Result<Box<dyn NaContext>, NaError> {
        Ok(Box::new(SmContext))
    }
}

impl Drop for SmClass {
    fn drop(&mut self) {
        if let Some((_, path)) = self.socket.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), "failed to remove sm socket: {}", e);
            }
        }
    }
}

struct SmContext;

impl NaContext for SmContext {}
