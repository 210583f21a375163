mod common;

use nix::sys::signal;

use lockstep::procs::{invoke, Member, OrderedGroup, Signal, SignalMonitor};

use common::{events, snapshot, Script, Scripted};

// the only test in this binary that raises process signals, so nothing else observes them
#[tokio::test]
async fn process_signal_stops_the_group_in_reverse() {
    let events = events();
    let group = OrderedGroup::new(vec![
        Member::new("a", Scripted::new("a", &events, Script::Normal)),
        Member::new("b", Scripted::new("b", &events, Script::Normal)),
    ])
    .expect("group");

    let monitor = invoke("monitor", SignalMonitor::new(group)).await;

    signal::raise(Signal::SIGTERM).expect("raise SIGTERM");
    monitor.wait().await.expect("orderly shutdown");

    let events = snapshot(&events);
    assert_eq!(
        events[4..].to_vec(),
        vec![
            "b:signal SIGTERM".to_string(),
            "b:exit".to_string(),
            "a:signal SIGTERM".to_string(),
            "a:exit".to_string(),
        ]
    );
}
