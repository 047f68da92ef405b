use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use zb_broker_mock::{MockBroker, MockBrokerConfig};
use zb_client::{ClientConfig, Connection, Deployment, ErrorKind, Task, WorkflowInstance};
use zb_proto::{error_codes, ClientFrame};

async fn connect(broker: &MockBroker, request_timeout_ms: u64) -> Connection {
    let mut config = ClientConfig::default()
        .with_broker_address(&broker.address())
        .unwrap();
    config.client.request_timeout_ms = request_timeout_ms;
    Connection::open(&config).await.unwrap()
}

#[tokio::test]
async fn test_create_task_round_trip() {
    let broker = MockBroker::start(MockBrokerConfig::default()).await.unwrap();
    let connection = connect(&broker, 1_000).await;

    let response = connection
        .create_task("default-topic", &Task::new("payment"))
        .await
        .unwrap();

    assert!(response.error.is_none());
    assert_eq!(response.state, "CREATED");
    assert_eq!(response.topic_name, "default-topic");
    assert_eq!(response.field("type"), Some(&Value::from("payment")));
    assert_eq!(response.field("state"), Some(&Value::from("CREATED")));

    match &broker.received()[..] {
        [ClientFrame::ExecuteCommand(req)] => assert_eq!(req.state, b"CREATE".to_vec()),
        other => panic!("Unexpected frames: {:?}", other),
    }
}

#[tokio::test]
async fn test_sequential_requests_get_their_own_responses() {
    let broker = MockBroker::start(MockBrokerConfig::default()).await.unwrap();
    let connection = connect(&broker, 1_000).await;

    for n in 0..5 {
        let task_type = format!("sequential-{}", n);
        let response = connection
            .create_task("default-topic", &Task::new(task_type.clone()))
            .await
            .unwrap();
        assert_eq!(response.field("type"), Some(&Value::from(task_type)));
    }
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_responses() {
    let broker = MockBroker::start(MockBrokerConfig::default()).await.unwrap();
    let connection = Arc::new(connect(&broker, 2_000).await);

    let mut handles = Vec::new();
    for n in 0..8 {
        let connection = connection.clone();
        handles.push(tokio::spawn(async move {
            let process_id = format!("process-{}", n);
            let response = connection
                .create_workflow_instance("default-topic", &WorkflowInstance::new(process_id.clone()))
                .await
                .unwrap();
            (process_id, response)
        }));
    }

    for handle in handles {
        let (process_id, response) = handle.await.unwrap();
        assert_eq!(response.state, "WORKFLOW_INSTANCE_CREATED");
        assert_eq!(response.field("bpmnProcessId"), Some(&Value::from(process_id)));
        assert_eq!(response.field("workflowInstanceKey"), Some(&Value::from(response.key)));
    }
}

#[tokio::test]
async fn test_deploy_reports_state() {
    let broker = MockBroker::start(MockBrokerConfig::default()).await.unwrap();
    let connection = connect(&broker, 1_000).await;

    let resource = b"<bpmn:definitions/>".to_vec();
    let response = connection
        .deploy("default-topic", Deployment::new(resource.clone()))
        .await
        .unwrap();

    assert_eq!(response.field("state"), Some(&Value::from("DEPLOYMENT_CREATED")));
    assert_eq!(response.field("resourceSize"), Some(&Value::from(resource.len())));

    match &broker.received()[..] {
        [ClientFrame::ExecuteCommand(req)] => {
            assert_eq!(req.command, resource);
            assert_eq!(req.state, b"CREATE_DEPLOYMENT".to_vec());
        }
        other => panic!("Unexpected frames: {:?}", other),
    }
}

#[tokio::test]
async fn test_broker_error_is_reported_on_response() {
    let broker = MockBroker::start(MockBrokerConfig {
        topics: vec!["orders".to_string()],
        ..Default::default()
    })
    .await
    .unwrap();
    let connection = connect(&broker, 1_000).await;

    let response = connection
        .create_workflow_instance("missing", &WorkflowInstance::new("order"))
        .await
        .unwrap();
    let error = response.error.clone().unwrap();
    assert_eq!(error.code, error_codes::TOPIC_NOT_FOUND);

    let err = response.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Broker);

    // The connection stays usable after a broker error.
    let response = connection
        .create_workflow_instance("orders", &WorkflowInstance::new("order"))
        .await
        .unwrap();
    assert!(response.error.is_none());
}

#[tokio::test]
async fn test_request_timeout_is_distinct_from_transport() {
    let broker = MockBroker::start(MockBrokerConfig {
        response_delay: Duration::from_millis(300),
        slow_responses: 1,
        ..Default::default()
    })
    .await
    .unwrap();
    let connection = connect(&broker, 100).await;

    let err = connection
        .create_task("default-topic", &Task::new("slow"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // Let the late response arrive; it must not be mistaken for the next one.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let response = connection
        .create_task("default-topic", &Task::new("fast"))
        .await
        .unwrap();
    assert_eq!(response.field("type"), Some(&Value::from("fast")));
}

#[tokio::test]
async fn test_late_response_is_not_handed_to_the_next_request() {
    let broker = MockBroker::start(MockBrokerConfig {
        response_delay: Duration::from_millis(300),
        slow_responses: 1,
        ..Default::default()
    })
    .await
    .unwrap();
    let connection = connect(&broker, 200).await;

    let err = connection
        .create_task("default-topic", &Task::new("slow"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // Sent right away, so the late "slow" response arrives while this one waits.
    let response = connection
        .create_task("default-topic", &Task::new("fast"))
        .await
        .unwrap();
    assert_eq!(response.field("type"), Some(&Value::from("fast")));
}

#[tokio::test]
async fn test_abandoned_request_does_not_shift_responses() {
    let broker = MockBroker::start(MockBrokerConfig {
        response_delay: Duration::from_millis(300),
        slow_responses: 1,
        ..Default::default()
    })
    .await
    .unwrap();
    let connection = connect(&broker, 2_000).await;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        connection.create_task("default-topic", &Task::new("abandoned")),
    )
    .await;
    assert!(abandoned.is_err());

    let response = connection
        .create_task("default-topic", &Task::new("fresh"))
        .await
        .unwrap();
    assert_eq!(response.field("type"), Some(&Value::from("fresh")));

    let response = connection
        .create_task("default-topic", &Task::new("after"))
        .await
        .unwrap();
    assert_eq!(response.field("type"), Some(&Value::from("after")));
}

#[tokio::test]
async fn test_requests_fail_after_broker_disconnects() {
    let broker = MockBroker::start(MockBrokerConfig::default()).await.unwrap();
    let connection = connect(&broker, 500).await;

    broker.disconnect_all();
    for _ in 0..50 {
        if !connection.is_open() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!connection.is_open());

    let err = connection
        .create_task("default-topic", &Task::new("late"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn test_open_unreachable_broker_is_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);

    let config = ClientConfig::default()
        .with_broker_address(&address)
        .unwrap();
    let err = Connection::open(&config).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn test_empty_topic_is_rejected_before_sending() {
    let broker = MockBroker::start(MockBrokerConfig::default()).await.unwrap();
    let connection = connect(&broker, 1_000).await;

    let err = connection
        .deploy("  ", Deployment::new(b"<bpmn/>".to_vec()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(broker.received().is_empty());
}
