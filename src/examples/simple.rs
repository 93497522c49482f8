//! Simple example of using reqwest-proxy-race.

use reqwest_middleware::ClientBuilder;
use reqwest_proxy_race::{ProxyQueue, ProxyRaceMiddleware, SourceFetcher, TransportConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("Setting up proxy queue...");

    let queue = ProxyQueue::new();
    // free proxy lists, fetched on the first request
    queue
        .set_fetcher(
            SourceFetcher::new(vec![
                "https://cdn.jsdelivr.net/gh/proxifly/free-proxy-list@main/proxies/protocols/http/data.txt",
                "https://cdn.jsdelivr.net/gh/dpangestuw/Free-Proxy@main/http_proxies.txt",
            ])
            .shuffle(true),
        )
        .await?;

    let config = TransportConfig::builder()
        // three proxies race for every request
        .fan_out(3)
        .connect_timeout(Duration::from_secs(5))
        .request_timeout(Duration::from_secs(15))
        .build();

    let client = ClientBuilder::new(reqwest::Client::new())
        .with(ProxyRaceMiddleware::new(queue.clone(), config))
        .build();

    println!("Sending request...");
    let response = client.get("http://httpbin.org/ip").send().await?;

    println!("Status: {}", response.status());
    println!("Response: {}", response.text().await?);

    let stats = queue.stats().await?;
    println!("Queue: {} available of {} registered", stats.available, stats.registered);

    queue.close().await;
    Ok(())
}
