//! Test lifecycle and polling

use std::any::Any;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Owns the resources of one test; everything is released on drop
pub struct TestContext {
    temp_dir: TempDir,
    resources: Vec<Box<dyn Any>>,
}

impl TestContext {
    /// Fresh context with its own temporary directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        Self {
            temp_dir,
            resources: Vec::new(),
        }
    }

    /// Root of the temporary directory
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// `name` under the root, created if missing
    pub fn subdir(&self, name: &str) -> PathBuf {
        let dir = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&dir).expect("Failed to create test subdirectory");
        dir
    }

    /// Keep `resource` alive until the context is dropped
    pub fn register<T: Any>(&mut self, resource: T) {
        self.resources.push(Box::new(resource));
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        // Reverse registration order, then the directory
        while let Some(resource) = self.resources.pop() {
            drop(resource);
        }
    }
}

/// Poll `condition` every 20 ms until it holds or `timeout` elapses
///
/// Returns whether the condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
