use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use strand::{Connection, ConnectionOwner, Error, Protocol, Transport, TransportHandle};

#[derive(Clone, Default)]
struct Recorder {
    state: Arc<Mutex<RecorderState>>,
}

#[derive(Default)]
struct RecorderState {
    data: Vec<u8>,
    losses: Vec<String>,
}

impl Recorder {
    fn data(&self) -> Vec<u8> {
        self.state.lock().unwrap().data.clone()
    }

    fn losses(&self) -> Vec<String> {
        self.state.lock().unwrap().losses.clone()
    }
}

impl Protocol for Recorder {
    fn connection_made(&mut self, _transport: TransportHandle) {}

    fn data_received(&mut self, data: &[u8]) {
        self.state.lock().unwrap().data.extend_from_slice(data);
    }

    fn connection_lost(&mut self, reason: &Error) {
        self.state.lock().unwrap().losses.push(reason.kind_name().to_string());
    }
}

struct NoopOwner;

impl ConnectionOwner for NoopOwner {
    fn remove_connection(&self, _id: u64) {}
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn reassembles_bytes_across_fragments() {
    let (near, far) = tokio::io::duplex(64);
    let recorder = Recorder::default();
    let _connection =
        Connection::establish(0, Box::new(near), recorder.clone(), Arc::new(NoopOwner));

    let payload: Vec<u8> = (0u8..=255).cycle().take(10_000).collect();
    let (mut rd, mut wr) = tokio::io::split(far);
    tokio::spawn(async move {
        // Keep the far read side open until everything is written.
        let mut sink = [0u8; 64];
        while rd.read(&mut sink).await.unwrap_or(0) > 0 {}
    });
    for chunk in payload.chunks(977) {
        wr.write_all(chunk).await.unwrap();
    }
    wr.shutdown().await.unwrap();
    drop(wr);

    let probe = recorder.clone();
    wait_for(move || probe.losses().len() == 1).await;
    assert_eq!(recorder.data(), payload);
    assert_eq!(recorder.losses(), vec!["ConnectionClosed"]);
}

#[tokio::test]
async fn peer_eof_reports_connection_closed_once() {
    let (near, far) = tokio::io::duplex(64);
    let recorder = Recorder::default();
    let _connection =
        Connection::establish(1, Box::new(near), recorder.clone(), Arc::new(NoopOwner));
    drop(far);

    let probe = recorder.clone();
    wait_for(move || !probe.losses().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(recorder.losses(), vec!["ConnectionClosed"]);
}

#[tokio::test]
async fn oversized_write_overflows_and_leaves_the_transport_open() {
    let (near, far) = tokio::io::duplex(1 << 16);
    let (transport, handle) = Transport::with_max_buffer(near, 16);
    let mut recorder = Recorder::default();
    let driver = tokio::spawn(async move { transport.run(&mut recorder).await });

    let err = handle.write(&[0u8; 17]).unwrap_err();
    assert!(matches!(err, Error::BufferOverflow { requested: 17, max: 16 }));
    assert!(!handle.is_closed());

    // The transport is still usable after the refused write.
    handle.write(&[7u8; 8]).unwrap();
    let (mut rd, _wr) = tokio::io::split(far);
    let mut received = [0u8; 8];
    rd.read_exact(&mut received).await.unwrap();
    assert_eq!(received, [7u8; 8]);

    handle.close();
    let reason = driver.await.unwrap();
    assert!(reason.is_connection_closed());
}

#[tokio::test]
async fn close_is_idempotent_and_reports_loss_once() {
    let (near, far) = tokio::io::duplex(64);
    let recorder = Recorder::default();
    let connection =
        Connection::establish(2, Box::new(near), recorder.clone(), Arc::new(NoopOwner));

    connection.close();
    connection.close();

    let probe = recorder.clone();
    wait_for(move || !probe.losses().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(recorder.losses(), vec!["ConnectionClosed"]);

    assert!(matches!(
        connection.transport().write(b"late"),
        Err(Error::ConnectionClosed)
    ));
    drop(far);
}
