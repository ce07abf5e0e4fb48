use std::time::Duration;

use rmpv::Value;
use strand::rpc::msgpack::MsgPackFactory;
use strand::rpc::Dispatch;
use strand::Client;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let client = Client::tcp(MsgPackFactory::new(Dispatch::new()), "127.0.0.1:8470");
    let protocol = client.connect(Duration::from_secs(5)).await?;
    let mut proxy = protocol.proxy().result(Some(Duration::from_secs(5))).await?;
    proxy.set_timeout(Some(Duration::from_secs(5)));

    let sum = proxy.call("add", vec![Value::from(2), Value::from(3)]).await?;
    println!("add(2, 3) = {}", sum);

    for amount in [10, 20, 30] {
        let total = proxy.call("accumulate", vec![Value::from(amount)]).await?;
        println!("accumulate({}) = {}", amount, total);
    }

    client.disconnect();
    Ok(())
}
