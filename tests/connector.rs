use std::time::Duration;

use strand::{Connector, ConnectorState, Error};

#[tokio::test]
async fn refused_connect_resolves_with_the_connection_error() {
    // Bind and drop to find a port with nothing listening on it.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut connector = Connector::tcp(addr.to_string(), Duration::from_secs(5));
    let result = connector.start().unwrap();
    let err = result.into_result(Some(Duration::from_secs(2))).await.unwrap_err();
    // A refused connect is an I/O error, not a timeout.
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(connector.state(), ConnectorState::Errored);
}

#[tokio::test]
async fn missing_unix_path_resolves_with_the_connection_error() {
    let mut path = std::env::temp_dir();
    path.push(format!("strand-connector-missing-{}.sock", std::process::id()));
    let mut connector = Connector::unix(path, Duration::from_secs(5));
    let result = connector.start().unwrap();
    let err = result.into_result(Some(Duration::from_secs(2))).await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert_eq!(connector.state(), ConnectorState::Errored);
}

#[tokio::test]
async fn start_twice_is_a_programming_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut connector = Connector::tcp(addr.to_string(), Duration::from_secs(1));
    connector.start().unwrap();
    assert!(matches!(connector.start(), Err(Error::AlreadyCalled)));
}

#[tokio::test]
async fn successful_connect_resolves_with_the_stream() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = listener.accept().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
    });

    let mut connector = Connector::tcp(addr.to_string(), Duration::from_secs(5));
    let result = connector.start().unwrap();
    let stream = result.into_result(Some(Duration::from_secs(2))).await;
    assert!(stream.is_ok());
    assert_eq!(connector.state(), ConnectorState::Connected);
}

#[tokio::test]
async fn unstarted_connector_leaves_its_result_pending() {
    let mut connector = Connector::tcp("127.0.0.1:1", Duration::from_secs(1));
    // cancel before start is tolerated and resolves nothing
    connector.cancel();
    let err = connector
        .result()
        .into_result(Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));
    // the caller owns cancelling the result itself
    connector.result().cancel().unwrap();
    assert!(connector.result().is_cancelled());
}
