//! End-to-end scenarios against a scripted mock server, one per §8 case.

use nt_client::{AnnounceParams, Client, ClientConfig, SubscribeOptions, TopicProperties, TypeInfo, Value};
use nt_protocol::{BinaryFrame, ControlMessage};
use nt_test_support::MockNtServer;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn collector() -> (
    Arc<Mutex<Vec<(Value, AnnounceParams)>>>,
    nt_client::SubscriberCallback,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let callback: nt_client::SubscriberCallback = Arc::new(move |value, params| {
        seen2.lock().unwrap().push((value.clone(), params.clone()));
    });
    (seen, callback)
}

async fn connect_pair(server: &mut MockNtServer) -> (Client, nt_test_support::MockNtConnection) {
    let client = Client::connect_with_config(ClientConfig::with_exact_url(format!(
        "{}/nt/test",
        server.url()
    )));
    let conn = tokio::time::timeout(Duration::from_secs(2), server.accept())
        .await
        .expect("server should observe a connection")
        .expect("connection channel should not be closed");
    tokio::time::timeout(Duration::from_secs(2), client.wait_for_connection())
        .await
        .expect("client should reach OPEN");
    (client, conn)
}

fn as_control_messages(values: Vec<serde_json::Value>) -> Vec<ControlMessage> {
    values
        .into_iter()
        .map(|v| serde_json::from_value(v).expect("well-formed control message"))
        .collect()
}

#[tokio::test]
async fn subscribe_scalar() {
    let mut server = MockNtServer::start().await.unwrap();
    let (client, mut conn) = connect_pair(&mut server).await;

    let (seen, callback) = collector();
    client
        .subscribe(
            "/MyTable/Gyro",
            TypeInfo::double(),
            SubscribeOptions::default(),
            callback,
        )
        .unwrap();

    let sent = as_control_messages(conn.recv_control().await.unwrap());
    assert!(matches!(
        &sent[..],
        [ControlMessage::Subscribe(p)] if p.topics == ["/MyTable/Gyro"]
    ));

    conn.send_control(&[ControlMessage::Announce(nt_protocol::AnnounceParams {
        name: "/MyTable/Gyro".to_owned(),
        id: 3,
        type_name: "double".to_owned(),
        properties: Default::default(),
        pubuid: None,
    })]);
    conn.send_binary_frames(&[BinaryFrame::new(3, 1_000_000, 1, rmpv::Value::F64(1.234))]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let observed = seen.lock().unwrap();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].0, Value::Double(1.234));
    assert_eq!(observed[0].1.id, 3);
    assert_eq!(observed[0].1.type_name, "double");

    let topic = client.topic("/MyTable/Gyro", TypeInfo::double(), None).unwrap();
    assert_eq!(topic.last_changed_time(), 1_000_000);
}

#[tokio::test]
async fn publish_and_set() {
    let mut server = MockNtServer::start().await.unwrap();
    let (client, mut conn) = connect_pair(&mut server).await;

    let topic = client
        .topic(
            "/MyTable/AutoMode",
            TypeInfo::string(),
            Some(Value::String("No Auto".to_owned())),
        )
        .unwrap();

    let publish_task = {
        let topic = topic.clone();
        tokio::spawn(async move { topic.publish(TopicProperties::default(), None).await })
    };

    let sent = as_control_messages(conn.recv_control().await.unwrap());
    let pubuid = match &sent[..] {
        [ControlMessage::Publish(p)] => p.pubuid,
        other => panic!("unexpected first control batch: {other:?}"),
    };
    let _hotfix = as_control_messages(conn.recv_control().await.unwrap());

    conn.send_control(&[ControlMessage::Announce(nt_protocol::AnnounceParams {
        name: "/MyTable/AutoMode".to_owned(),
        id: 9,
        type_name: "string".to_owned(),
        properties: Default::default(),
        pubuid: Some(pubuid),
    })]);

    publish_task.await.unwrap().unwrap();
    assert!(topic.is_publisher());

    topic
        .set_value(Value::String("25 Ball Auto and Climb".to_owned()))
        .unwrap();
    let frames = conn.recv_binary().await.unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].type_num, 4);
    assert_eq!(
        frames[0].value.as_str(),
        Some("25 Ball Auto and Climb")
    );
}

#[tokio::test]
async fn prefix_subscription() {
    let mut server = MockNtServer::start().await.unwrap();
    let (client, mut conn) = connect_pair(&mut server).await;

    let (seen, callback) = collector();
    client.subscribe_prefix("/MyTable/Accelerometer/", SubscribeOptions::default(), callback);
    let _ = conn.recv_control().await.unwrap();

    conn.send_control(&[
        ControlMessage::Announce(nt_protocol::AnnounceParams {
            name: "/MyTable/Accelerometer/X".to_owned(),
            id: 10,
            type_name: "double".to_owned(),
            properties: Default::default(),
            pubuid: None,
        }),
        ControlMessage::Announce(nt_protocol::AnnounceParams {
            name: "/MyTable/Accelerometer/Y".to_owned(),
            id: 11,
            type_name: "int".to_owned(),
            properties: Default::default(),
            pubuid: None,
        }),
        ControlMessage::Announce(nt_protocol::AnnounceParams {
            name: "/MyTable/Accelerometer/Z".to_owned(),
            id: 12,
            type_name: "double".to_owned(),
            properties: Default::default(),
            pubuid: None,
        }),
    ]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    conn.send_binary_frames(&[
        BinaryFrame::new(10, 1, 1, rmpv::Value::F64(1.4)),
        BinaryFrame::new(11, 2, 2, rmpv::Value::Integer(3.into())),
        BinaryFrame::new(12, 3, 1, rmpv::Value::F64(3.6)),
    ]);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let observed = seen.lock().unwrap();
    assert_eq!(observed.len(), 3);
    assert_eq!(observed[0].0, Value::Double(1.4));
    assert_eq!(observed[1].0, Value::Int(3));
    assert_eq!(observed[1].1.type_name, "int");
    assert_eq!(observed[2].0, Value::Double(3.6));
}

#[tokio::test]
async fn reconnect_replay_sends_subscribes_then_publishes() {
    let mut server = MockNtServer::start().await.unwrap();
    let (client, mut conn) = connect_pair(&mut server).await;

    let (_seen, callback) = collector();
    client
        .subscribe("/a", TypeInfo::double(), SubscribeOptions::default(), callback)
        .unwrap();
    let _ = conn.recv_control().await.unwrap();

    let topic = client.topic("/b", TypeInfo::double(), None).unwrap();
    let publish_task = {
        let topic = topic.clone();
        tokio::spawn(async move { topic.publish(TopicProperties::default(), None).await })
    };
    let _ = conn.recv_control().await.unwrap(); // publish
    let _ = conn.recv_control().await.unwrap(); // topicsonly hotfix subscribe
    conn.send_control(&[ControlMessage::Announce(nt_protocol::AnnounceParams {
        name: "/b".to_owned(),
        id: 1,
        type_name: "double".to_owned(),
        properties: Default::default(),
        pubuid: Some(0),
    })]);
    publish_task.await.unwrap().unwrap();

    conn.close();
    let mut new_conn = tokio::time::timeout(Duration::from_secs(3), server.accept())
        .await
        .expect("client should reconnect within the 1s backoff + margin")
        .unwrap();

    let mut seen_publish = false;
    for _ in 0..4 {
        let Some(batch) = new_conn.recv_control().await else {
            break;
        };
        let msgs = as_control_messages(batch);
        for msg in msgs {
            match msg {
                ControlMessage::Subscribe(_) => assert!(!seen_publish, "publish replayed before a subscribe"),
                ControlMessage::Publish(_) => seen_publish = true,
                other => panic!("unexpected replay message: {other:?}"),
            }
        }
        if seen_publish {
            break;
        }
    }
    assert!(seen_publish, "expected a publish to be replayed on reconnect");
    let _ = client;
}

#[tokio::test]
async fn publish_times_out_when_an_exact_subscription_already_exists() {
    let mut server = MockNtServer::start().await.unwrap();
    let (client, mut conn) = connect_pair(&mut server).await;

    let (_seen, callback) = collector();
    client
        .subscribe("/timeout", TypeInfo::double(), SubscribeOptions::default(), callback)
        .unwrap();
    let _ = conn.recv_control().await.unwrap();

    let topic = client.topic("/timeout", TypeInfo::double(), None).unwrap();
    let result = tokio::time::timeout(
        Duration::from_millis(3500),
        topic.publish(TopicProperties::default(), None),
    )
    .await
    .expect("publish future should settle within the timeout window");

    assert!(result.is_err());
    assert!(!topic.is_publisher());
    let _ = conn.recv_control().await; // drain the publish + hotfix subscribe
}
