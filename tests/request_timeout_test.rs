//! Scenario 8 (spec.md §8, §4.4.5): a request that outlives its
//! configured `requestTimeout` is failed with a gateway-timeout-shaped
//! error, and the backend that never answered is stopped.

mod support;

use std::time::Duration;

use modelmux::group::GroupError;
use modelmux::manager::ManagerError;
use modelmux::process::{ProcessError, ProcessState};
use support::{drain_events, fake_backend_path, manager_from_yaml, send_chat, state_changes};

fn config_yaml(bin: &str) -> String {
    format!(
        r#"
startPort: 6400
models:
  a:
    cmd: "{bin} --port ${{PORT}} --tag a --hang"
    requestTimeout: 1
"#
    )
}

#[tokio::test]
async fn a_hung_backend_times_out_the_request_and_is_stopped() {
    let bin = fake_backend_path();
    let manager = manager_from_yaml(&config_yaml(bin));
    let mut events = manager.events().subscribe();

    let err = send_chat(&manager, "a").await.expect_err("a backend that never answers must time out");
    assert!(
        matches!(err, ManagerError::Group(GroupError::Process(ProcessError::RequestTimeout))),
        "got {err:?}"
    );

    let seen = drain_events(&mut events, Duration::from_secs(3)).await;
    let states = state_changes(&seen, "a");
    assert!(states.contains(&(ProcessState::Starting, ProcessState::Ready)), "{states:?}");
    assert!(states.contains(&(ProcessState::Ready, ProcessState::Stopping)), "{states:?}");
    assert!(states.contains(&(ProcessState::Stopping, ProcessState::Stopped)), "{states:?}");
}
