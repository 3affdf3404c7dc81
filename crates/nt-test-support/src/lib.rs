// nt-test-support: a mock NT4 server for exercising nt-client against a
// scripted peer instead of a real robot or dashboard.

pub mod mock_server;

pub use mock_server::{MockEvent, MockNtConnection, MockNtServer};

#[cfg(test)]
mod tests {
    use super::*;
    use nt_protocol::{AnnounceParams, ControlMessage, TopicProperties};

    #[tokio::test]
    async fn server_starts_and_reports_a_real_port() {
        let server = MockNtServer::start().await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn server_observes_a_client_subscribe_and_can_reply_with_announce() {
        let mut server = MockNtServer::start().await.unwrap();
        let url = server.url();

        let client = tokio::spawn(async move {
            let (ws, _) =
                tokio_tungstenite::connect_async(format!("{url}/nt/test-client"))
                    .await
                    .unwrap();
            ws
        });

        let mut conn = server.accept().await.unwrap();
        let _ws = client.await.unwrap();

        conn.send_control(&[ControlMessage::Announce(AnnounceParams {
            name: "/MyTable/Gyro".to_owned(),
            id: 3,
            type_name: "double".to_owned(),
            properties: TopicProperties::default(),
            pubuid: None,
        })]);

        // This test only exercises the mock server's own accept/send path;
        // nt-client's integration tests assert on what the client observes.
    }
}
