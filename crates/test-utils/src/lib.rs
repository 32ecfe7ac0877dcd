pub mod builders;
pub mod fake_executor;

use std::sync::Once;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt};

use flowmgr::data::{DataId, DataObject, DataStatus};
use flowmgr::engine::ManagerEvent;

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// Logs go through `with_test_writer()`, so they only show up for failing
/// tests (or with `-- --nocapture`). Levels come from `RUST_LOG`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Ask a running manager for the current state of `id`.
pub async fn query(tx: &mpsc::Sender<ManagerEvent>, id: DataId) -> Option<DataObject> {
    let (reply, rx) = tokio::sync::oneshot::channel();
    tx.send(ManagerEvent::Query { id, reply })
        .await
        .expect("manager event channel closed");
    rx.await.expect("manager dropped query reply")
}

/// Poll a running manager until `id` reaches `status`.
pub async fn wait_for_status(tx: &mpsc::Sender<ManagerEvent>, id: DataId, status: DataStatus) -> DataObject {
    with_timeout(async {
        loop {
            if let Some(object) = query(tx, id).await {
                if object.status == status {
                    return object;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}
