use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use strand::rpc::json::JsonFactory;
use strand::rpc::{arg, Dispatch, Reply};
use strand::{frame, Client, Connection, ConnectionOwner, Error, ProtocolFactory, Server};

const DEBUG: bool = false;

fn init_tracing() {
    if DEBUG {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(tracing::Level::TRACE)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

struct NoopOwner;

impl ConnectionOwner for NoopOwner {
    fn remove_connection(&self, _id: u64) {}
}

fn adder_dispatch() -> Dispatch<Value> {
    let mut dispatch = Dispatch::new();
    dispatch.add_with_arity("add", 2, |args| {
        let a: i64 = arg(&args, 0)?;
        let b: i64 = arg(&args, 1)?;
        Ok(Reply::Ready(json!(a + b)))
    });
    dispatch
}

#[tokio::test]
async fn tcp_client_calls_and_error_responses() -> Result<(), Error> {
    init_tracing();
    let server = Server::bind_tcp("127.0.0.1:0", JsonFactory::new(adder_dispatch())).await?;
    server.start()?;
    let addr = server.local_addr().expect("tcp server address");

    let client = Client::tcp(JsonFactory::new(Dispatch::new()), addr.to_string());
    let protocol = client.connect(Duration::from_secs(5)).await?;
    let mut proxy = protocol.proxy().result(Some(Duration::from_secs(5))).await?;
    proxy.set_timeout(Some(Duration::from_secs(5)));

    let sum = proxy.call("add", vec![json!(2), json!(3)]).await?;
    assert_eq!(sum.as_i64(), Some(5));

    let err = proxy.call("unknown_method", vec![]).await.unwrap_err();
    match err {
        Error::Remote { kind, .. } => assert_eq!(kind, "UnknownMethodError"),
        other => panic!("unexpected error: {:?}", other),
    }

    client.disconnect();
    server.shutdown()?;
    Ok(())
}

#[tokio::test]
async fn notifications_reach_the_dispatcher() -> Result<(), Error> {
    init_tracing();
    let hits = Arc::new(Mutex::new(0i64));
    let mut dispatch = Dispatch::new();
    let bumped = hits.clone();
    dispatch.add_with_arity("bump", 0, move |_| {
        *bumped.lock().unwrap() += 1;
        Ok(Reply::Ready(Value::Null))
    });
    let peeked = hits.clone();
    dispatch.add_with_arity("count", 0, move |_| {
        Ok(Reply::Ready(json!(*peeked.lock().unwrap())))
    });

    let server = Server::bind_tcp("127.0.0.1:0", JsonFactory::new(dispatch)).await?;
    server.start()?;
    let addr = server.local_addr().expect("tcp server address");

    let client = Client::tcp(JsonFactory::new(Dispatch::new()), addr.to_string());
    let protocol = client.connect(Duration::from_secs(5)).await?;
    let mut proxy = protocol.proxy().result(Some(Duration::from_secs(5))).await?;
    proxy.set_timeout(Some(Duration::from_secs(5)));

    proxy.notify("bump", vec![])?;
    proxy.notify("bump", vec![])?;
    let count = proxy.call("count", vec![]).await?;
    assert_eq!(count.as_i64(), Some(2));

    client.disconnect();
    server.shutdown()?;
    Ok(())
}

async fn read_frame<R: AsyncReadExt + Unpin>(rd: &mut R) -> Value {
    let mut prefix = [0u8; 4];
    rd.read_exact(&mut prefix).await.unwrap();
    let len = u32::from_be_bytes(prefix) as usize;
    let mut payload = vec![0u8; len];
    rd.read_exact(&mut payload).await.unwrap();
    serde_json::from_slice(&payload).unwrap()
}

#[tokio::test]
async fn raw_frames_round_trip_and_kwargs_are_rejected() {
    init_tracing();
    let factory = JsonFactory::new(adder_dispatch());
    let protocol = factory.build();
    let (near, far) = tokio::io::duplex(1024);
    let _connection = Connection::establish(0, Box::new(near), protocol, Arc::new(NoopOwner));
    let (mut rd, mut wr) = tokio::io::split(far);

    // Named arguments are answered with a typed error.
    let request = serde_json::to_vec(&json!([0, 1, "add", [1, 2], { "x": 1 }])).unwrap();
    wr.write_all(&frame(&request)).await.unwrap();
    let response = read_frame(&mut rd).await;
    assert_eq!(response[0], json!(3));
    assert_eq!(response[1], json!(1));
    assert_eq!(response[2][0], json!("BadArgumentsError"));

    // A plain request gets a tag-2 response with the result.
    let request = serde_json::to_vec(&json!([0, 2, "add", [4, 5], {}])).unwrap();
    wr.write_all(&frame(&request)).await.unwrap();
    let response = read_frame(&mut rd).await;
    assert_eq!(response, json!([2, 2, 9]));
}
