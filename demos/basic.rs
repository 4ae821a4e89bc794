//! Minimal end-to-end usage of the client against a locally running
//! Flagr-compatible service. Run `FLAGR_ENDPOINT=http://localhost:18000
//! cargo run --example basic`.

use flagr_client::{Client, ContextValue, EvaluationContext, FlagrOptions};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let client = Client::new(FlagrOptions::default())
        .await
        .expect("failed to start flagr client");

    let ctx = EvaluationContext::new("user-123")
        .with_entity_type("user")
        .with_property("country", ContextValue::String("BR".into()));

    match client.evaluate_bool("brazil_launch", &ctx).await {
        Ok(enabled) => println!("brazil_launch: {enabled}"),
        Err(err) => eprintln!("evaluation failed: {err}"),
    }

    let theme = client
        .evaluate_string("ui_theme", &ctx, "light")
        .await
        .unwrap_or_else(|_| "light".to_string());
    println!("ui_theme: {theme}");

    let stats = client.get_stats().await;
    println!(
        "cache: {} flags, hit ratio {:.2}",
        stats.cached_flags,
        stats.cache.hit_ratio()
    );

    client.stop().await;
}
