use std::sync::{Arc, Mutex};

use rmpv::Value;
use strand::rpc::msgpack::MsgPackFactory;
use strand::rpc::{arg, object_dispatch, RemoteInterface, RemoteMethod, Reply};
use strand::Server;

struct Calculator {
    total: Mutex<i64>,
}

impl Calculator {
    fn add(&self, args: Vec<Value>) -> Result<Reply<Value>, strand::Error> {
        let a: i64 = arg(&args, 0)?;
        let b: i64 = arg(&args, 1)?;
        Ok(Reply::Ready(Value::from(a + b)))
    }

    fn accumulate(&self, args: Vec<Value>) -> Result<Reply<Value>, strand::Error> {
        let amount: i64 = arg(&args, 0)?;
        let mut total = self.total.lock().expect("total lock");
        *total += amount;
        Ok(Reply::Ready(Value::from(*total)))
    }
}

impl RemoteInterface<Value> for Calculator {
    fn remote_methods() -> Vec<RemoteMethod<Self, Value>> {
        vec![
            RemoteMethod { name: "add", arity: Some(2), invoke: |c, args| c.add(args) },
            RemoteMethod { name: "accumulate", arity: Some(1), invoke: |c, args| c.accumulate(args) },
        ]
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let dispatch = object_dispatch(Arc::new(Calculator { total: Mutex::new(0) }));
    let server = Server::bind_tcp("127.0.0.1:8470", MsgPackFactory::new(dispatch)).await?;
    server.start()?;
    tracing::info!("serving on 127.0.0.1:8470, ctrl-c to stop");

    // Shutdown belongs to the application, not the library.
    tokio::signal::ctrl_c().await?;
    server.shutdown()?;
    Ok(())
}
