//! Scenario 1 (spec.md §8): a cold call to an idle model spawns its
//! backend and serves once health turns ready; a call to a different
//! member of a `swap`+`exclusive` group stops the first before starting
//! the second.

mod support;

use std::time::Duration;

use modelmux::process::ProcessState;
use support::{drain_events, fake_backend_path, manager_from_yaml, send_chat, state_changes};

fn config_yaml(bin: &str) -> String {
    format!(
        r#"
startPort: 6100
groups:
  pair:
    swap: true
    exclusive: true
    members: [a, b]
models:
  a:
    cmd: "{bin} --port ${{PORT}} --tag a"
  b:
    cmd: "{bin} --port ${{PORT}} --tag b"
"#
    )
}

#[tokio::test]
async fn cold_start_spawns_and_serves_the_requested_model() {
    let bin = fake_backend_path();
    let manager = manager_from_yaml(&config_yaml(bin));

    let response = send_chat(&manager, "a").await.expect("cold start must succeed");
    assert_eq!(response["backend"], "a");
}

#[tokio::test]
async fn swap_to_a_sibling_stops_the_previously_active_member() {
    let bin = fake_backend_path();
    let manager = manager_from_yaml(&config_yaml(bin));
    let mut events = manager.events().subscribe();

    let first = send_chat(&manager, "a").await.expect("model a should cold-start");
    assert_eq!(first["backend"], "a");

    let second = send_chat(&manager, "b").await.expect("model b should cold-start after the swap");
    assert_eq!(second["backend"], "b");

    let seen = drain_events(&mut events, Duration::from_secs(3)).await;

    let a_states = state_changes(&seen, "a");
    assert!(
        a_states.contains(&(ProcessState::Starting, ProcessState::Ready)),
        "model a must have reached Ready before being swapped out: {a_states:?}"
    );
    assert!(
        a_states.contains(&(ProcessState::Ready, ProcessState::Stopping)),
        "swapping to b must stop a: {a_states:?}"
    );
    assert!(
        a_states.contains(&(ProcessState::Stopping, ProcessState::Stopped)),
        "a's stop must reach Stopped: {a_states:?}"
    );

    let b_states = state_changes(&seen, "b");
    assert!(b_states.contains(&(ProcessState::Starting, ProcessState::Ready)));
}
