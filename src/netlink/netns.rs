//! Network-namespace entry
//!
//! The kernel scopes `setns` to the calling thread, and tokio may migrate
//! tasks between worker threads, so namespace work runs on a dedicated OS
//! thread with its own single-threaded runtime. The guard restores the
//! original namespace when dropped.

use anyhow::{Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use nix::sched::{setns, CloneFlags};
    use std::fs::File;
    use std::os::fd::AsFd;
    use tracing::error;

    /// Holds the original namespace open; restores it on drop.
    pub struct NetnsGuard {
        original: File,
    }

    impl NetnsGuard {
        pub fn enter(netns_path: &Path) -> Result<Self> {
            let original = File::open("/proc/self/ns/net")
                .context("failed to open current network namespace")?;
            let target = File::open(netns_path).with_context(|| {
                format!("failed to open network namespace {}", netns_path.display())
            })?;
            setns(target.as_fd(), CloneFlags::CLONE_NEWNET).with_context(|| {
                format!("failed to enter network namespace {}", netns_path.display())
            })?;
            Ok(Self { original })
        }
    }

    impl Drop for NetnsGuard {
        fn drop(&mut self) {
            if let Err(e) = setns(self.original.as_fd(), CloneFlags::CLONE_NEWNET) {
                // The thread is about to die anyway; it must not be reused.
                error!("failed to restore original network namespace: {}", e);
            }
        }
    }

    pub fn run_in_netns<T, F, Fut>(netns_path: &Path, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>>,
        T: Send + 'static,
    {
        let _guard = NetnsGuard::enter(netns_path)?;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build namespace runtime")?;
        rt.block_on(f())
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn run_in_netns<T, F, Fut>(netns_path: &Path, _f: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>>,
        T: Send + 'static,
    {
        anyhow::bail!(
            "network namespaces are not supported on this platform ({})",
            netns_path.display()
        )
    }
}

/// Run `f` with the calling thread switched into `netns_path`, restoring
/// the original namespace afterwards. Spawns a dedicated thread so the
/// namespace switch never leaks into the async runtime's worker pool.
pub async fn with_netns<T, F, Fut>(netns_path: &Path, f: F) -> Result<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>>,
    T: Send + 'static,
{
    let path: PathBuf = netns_path.to_path_buf();
    tokio::task::spawn_blocking(move || imp::run_in_netns(&path, f))
        .await
        .context("namespace worker thread panicked")?
}
