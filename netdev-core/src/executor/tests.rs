use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::device::DeviceType;
use crate::parse::ParserRegistry;
use crate::testing::{SimDevice, device, pool_config, sim_pool};

fn executor() -> (Arc<crate::testing::SimConnector>, CommandExecutor) {
    let (connector, pool) = sim_pool(pool_config());
    (connector, CommandExecutor::new(pool, Arc::new(ParserRegistry::new())))
}

#[tokio::test(start_paused = true)]
async fn test_execute_normalizes_output() {
    let (connector, executor) = executor();
    connector.add("r1", SimDevice::ios("r1"));
    let r1 = device("r1", DeviceType::CiscoIos);

    let result = executor
        .execute(&r1, &CommandRequest::new("show version"))
        .await
        .unwrap();
    assert!(result.success);
    assert!(result.output.starts_with("Cisco IOS Software"));
    assert!(!result.output.contains("r1#"));
    assert!(result.raw.ends_with("r1#"));
    assert_eq!(result.prompt, "r1#");
    assert!(result.structured.is_none());
    assert_eq!(executor.pool().idle_sessions("r1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_execute_with_builtin_parser() {
    let (connector, executor) = executor();
    connector.add("r1", SimDevice::ios("r1"));

    let result = executor
        .execute(
            &device("r1", DeviceType::CiscoIos),
            &CommandRequest::new("show version").with_parser("version"),
        )
        .await
        .unwrap();
    let structured = result.structured.unwrap();
    assert_eq!(structured["version"], "15.2(4)M7");
}

#[tokio::test(start_paused = true)]
async fn test_nxos_json_parser_appends_pipe() {
    let (connector, executor) = executor();
    connector.add("n1", SimDevice::nxos("n1"));

    let result = executor
        .execute(
            &device("n1", DeviceType::CiscoNxos),
            &CommandRequest::new("show version").with_parser("json"),
        )
        .await
        .unwrap();
    assert_eq!(result.structured.unwrap()["host_name"], "n1");
}

#[tokio::test(start_paused = true)]
async fn test_custom_parser_wins() {
    let (connector, executor) = executor();
    connector.add("r1", SimDevice::ios("r1"));
    executor.parsers().register(
        "version",
        Arc::new(|output: &str| Some(json!({ "lines": output.lines().count() }))),
    );

    let result = executor
        .execute(
            &device("r1", DeviceType::CiscoIos),
            &CommandRequest::new("show version").with_parser("version"),
        )
        .await
        .unwrap();
    assert_eq!(result.structured.unwrap()["lines"], 3);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_parser_is_not_an_error() {
    let (connector, executor) = executor();
    connector.add("r1", SimDevice::ios("r1"));

    let result = executor
        .execute(
            &device("r1", DeviceType::CiscoIos),
            &CommandRequest::new("show version").with_parser("no_such_parser"),
        )
        .await
        .unwrap();
    assert!(result.success);
    assert!(result.structured.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_device_error_is_reported_in_result() {
    let (connector, executor) = executor();
    connector.add("r1", SimDevice::ios("r1"));

    let result = executor
        .execute(&device("r1", DeviceType::CiscoIos), &CommandRequest::new("shwo version"))
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.failure_message.unwrap().contains("Invalid input"));
}

#[tokio::test(start_paused = true)]
async fn test_paging_is_answered() {
    let (connector, executor) = executor();
    connector.add("r1", SimDevice::ios("r1"));

    let result = executor
        .execute(&device("r1", DeviceType::CiscoIos), &CommandRequest::new("show logging"))
        .await
        .unwrap();
    assert_eq!(result.lines().count(), 30);
    assert!(!result.contains("--More--"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_surfaces_and_session_is_not_reused() {
    let (connector, executor) = executor();
    let sim = SimDevice::ios("r1").hang_on("show tech");
    connector.add("r1", sim.clone());
    let r1 = device("r1", DeviceType::CiscoIos);

    let err = executor
        .execute(
            &r1,
            &CommandRequest::new("show tech-support").with_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "CommandTimeout");
    assert_eq!(err.code(), crate::error::NETWORK_COMMAND_ERROR);
    assert_eq!(executor.pool().idle_sessions("r1"), 0);

    executor.execute(&r1, &CommandRequest::new("show version")).await.unwrap();
    assert_eq!(sim.total_connections(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_batch_fail_fast_stops() {
    let (connector, executor) = executor();
    let sim = SimDevice::ios("r1");
    connector.add("r1", sim.clone());

    let commands = vec![
        CommandRequest::new("show version"),
        CommandRequest::new("bogus"),
        CommandRequest::new("show running-config"),
    ];
    let results = executor
        .execute_batch(&device("r1", DeviceType::CiscoIos), &commands, BatchMode::FailFast, None)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].success);
    assert!(!results[1].success);
    assert_eq!(sim.received_count("show running-config"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_batch_best_effort_runs_all() {
    let (connector, executor) = executor();
    let sim = SimDevice::ios("r1");
    connector.add("r1", sim.clone());

    let commands = vec![
        CommandRequest::new("bogus"),
        CommandRequest::new("show version"),
    ];
    let results = executor
        .execute_batch(&device("r1", DeviceType::CiscoIos), &commands, BatchMode::BestEffort, None)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(!results[0].success);
    assert!(results[1].success);
    assert_eq!(sim.total_connections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_batch_timeout_applies_to_each_command() {
    let (connector, executor) = executor();
    connector.add("r1", SimDevice::ios("r1").hang_on("show tech"));

    let commands = vec![
        CommandRequest::new("show version"),
        CommandRequest::new("show tech-support"),
    ];
    let started = tokio::time::Instant::now();
    let err = executor
        .execute_batch(
            &device("r1", DeviceType::CiscoIos),
            &commands,
            BatchMode::BestEffort,
            Some(Duration::from_secs(1)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "CommandTimeout");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_commands_from_config_mode_are_wrapped() {
    let (connector, executor) = executor();
    let sim = SimDevice::junos("j1");
    connector.add("j1", sim.clone());
    let j1 = device("j1", DeviceType::JuniperJunos);

    let mut session = executor.pool().acquire(&j1, None).await.unwrap();
    session.acquire_privilege("configuration").await.unwrap();
    let result = executor
        .execute_on(&mut session, &CommandRequest::new("show version"))
        .await
        .unwrap();
    executor.pool().release(session, true).await;

    assert!(result.contains("Hostname: j1"));
    assert!(sim.received().contains(&"run show version | no-more".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_run_plan_stops_at_rejected_step() {
    let (connector, executor) = executor();
    let sim = SimDevice::ios("r1");
    connector.add("r1", sim.clone());

    let mut session = executor
        .pool()
        .acquire(&device("r1", DeviceType::CiscoIos), None)
        .await
        .unwrap();
    let handler = Arc::clone(session.handler());
    let plan = vec![
        Step::command("configure terminal"),
        Step::command("ntp server 10.0.0.200"),
        Step::command("bogus line"),
        Step::command("ntp server 10.0.0.201"),
    ];
    let err = run_plan(&mut session, handler.as_ref(), &plan, None).await.unwrap_err();
    assert_eq!(err.kind(), "CommandFailed");
    assert!(err.device_output().unwrap().contains("Invalid input"));
    assert!(session.in_config_mode());

    run_plan(&mut session, handler.as_ref(), &handler.exit_config_mode(), None)
        .await
        .unwrap();
    executor.pool().release(session, true).await;

    assert!(sim.running_config().contains("ntp server 10.0.0.200"));
    assert!(!sim.running_config().contains("ntp server 10.0.0.201"));
}
