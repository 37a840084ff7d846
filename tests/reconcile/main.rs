mod cycle;

use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use uuid::Uuid;

use staged::{
    git::testing::FakeGitBackend,
    intent::DeploymentIntent,
    queue::CoalescingQueue,
    reconciler::{Reconciler, ReconcilerSettings},
};

pub const FOO_URL: &str = "https://gitbox.apache.org/repos/asf/foo.git";
pub const BAR_URL: &str = "https://gitbox.apache.org/repos/asf/bar.git";

pub struct Fixture {
    pub root: PathBuf,
    pub backend: Arc<FakeGitBackend>,
    pub queue: CoalescingQueue,
    pub reconciler: Reconciler,
}

impl Fixture {
    pub fn new() -> Self {
        let root = std::env::temp_dir().join(format!("staged-reconcile-{}", Uuid::now_v7()));
        fs::create_dir_all(&root).expect("temp root should be created");

        let backend = Arc::new(FakeGitBackend::new());
        let queue = CoalescingQueue::new();
        let reconciler = Reconciler::new(
            ReconcilerSettings {
                root_dir: root.clone(),
                interval: Duration::from_millis(10),
            },
            backend.clone(),
            queue.clone(),
        );

        Self {
            root,
            backend,
            queue,
            reconciler,
        }
    }

    pub fn path(&self, target: &str) -> PathBuf {
        self.root.join(target)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

pub fn intent(target: &str, url: &str, branch: &str) -> DeploymentIntent {
    DeploymentIntent::new(target, url, branch, "jane")
}
