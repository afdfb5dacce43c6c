use agent_hub::common::{spot_price_topic, Quote, SpotPrice, Spread, Tick, Utc};
use agent_hub::{ChannelFeed, ExecutionClient, Hub, PaperExecutionClient};
use built_in_agents::config::from_toml_str;
use built_in_agents::{build_agent, spot_path, spread_path};
use std::sync::Arc;
use std::time::Duration;

const DEPLOYMENT: &str = r#"
    [[agents]]
    kind = "spotter"
    instruments = ["AAPL"]
    throttle = "0ms"

    [[agents]]
    kind = "spread_calculator"
    instruments = "AAPL"
    throttle = "0ms"
    min_data_size = 1
    window = 3

    [[agents]]
    kind = "portfolio_monitor"
    instruments = ["AAPL"]
    period = "1s"
"#;

fn quote(bid: f64, ask: f64, bid_size: f64, ask_size: f64) -> Tick {
    Tick::Quote(Quote {
        symbol: "AAPL".to_string(),
        bid_price: bid,
        ask_price: ask,
        bid_size,
        ask_size,
        timestamp: Utc::now(),
    })
}

#[tokio::test(start_paused = true)]
async fn test_quotes_flow_into_spot_and_spread() {
    let deployment = from_toml_str(DEPLOYMENT).unwrap();
    let execution = Arc::new(PaperExecutionClient::new(1_000.0));
    let (feed, sender) = ChannelFeed::new();
    let feed = Arc::new(feed);

    let mut hub = Hub::new(deployment.hub.clone())
        .with_feed(feed.clone())
        .with_execution(execution.clone() as Arc<dyn ExecutionClient>);
    for spec in &deployment.agents {
        hub.register(build_agent(spec).unwrap()).await.unwrap();
    }
    let descriptors = hub.agents();
    assert_eq!(descriptors.len(), 3);
    assert_eq!(descriptors[1].name, "spread_calculator");
    assert_eq!(descriptors[1].config.get_usize("window", 0).unwrap(), 3);

    let handle = hub.handle();
    let store = hub.store().clone();
    let bus = hub.bus().clone();
    let task = tokio::spawn(async move { hub.start().await });

    // one quote per second so no run is still in flight when the next tick lands
    for (bid, ask) in [(100.0, 101.0), (100.0, 102.0), (100.0, 103.0), (100.0, 104.0)] {
        sender.send(quote(bid, ask, 30.0, 10.0));
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let spot = store.get::<SpotPrice>(spot_path("AAPL")).unwrap();
    // (100 * 10 + 104 * 30) / 40
    assert_eq!(spot.fair_price, 103.0);

    // the window keeps the last three spreads: 2, 3 and 4
    let spread = store.get::<Spread>(spread_path("AAPL")).unwrap();
    assert_eq!(spread.samples, 3);
    assert_eq!(spread.value, 3.0);

    let last = bus.last_value(&spot_price_topic("AAPL")).await.unwrap();
    assert_eq!(last.payload::<SpotPrice>().map(|s| s.fair_price), Some(103.0));

    handle.stop();
    task.await.unwrap().unwrap();
    assert_eq!(feed.subscriptions(), vec![vec!["AAPL".to_string()]]);
}
