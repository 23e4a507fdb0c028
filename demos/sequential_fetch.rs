//! Three pages fetched strictly one after another, then a two-step mutation
//! chain that creates a record and publishes it.
//!
//! Run with `cargo run --example sequential_fetch`

use chained_query::{
    use_chained_query, ChainedMutations, ChainedQueryOptions, ChainedQueryProvider,
    ComputeVariablesFn, Mutation, MutationHandle, QueryClient, SequencerConfig,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn page_options(page: u64, delay_ms: u64) -> ChainedQueryOptions {
    ChainedQueryOptions::new(json!(["page", page]), move || async move {
        println!("[fetch] page {page} started");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(json!({ "page": page, "items": page * 10 }))
    })
    .on_settled(move |data, error| match (data, error) {
        (_, Some(error)) => println!("[settled] page {page} failed: {error}"),
        (data, None) => println!("[settled] page {page}: {}", data.cloned().unwrap_or_default()),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let client = QueryClient::new();
    let provider = ChainedQueryProvider::with_config(client, SequencerConfig::development())?;

    // Later pages are faster, but still start only after earlier ones settle
    let queries = provider
        .scope(async {
            let mut queries = Vec::new();
            for (page, delay_ms) in [(1, 600), (2, 300), (3, 100)] {
                queries.push(use_chained_query(page_options(page, delay_ms))?);
            }
            Ok::<_, chained_query::ChainedQueryError>(queries)
        })
        .await?;

    for query in &queries {
        let data = query.settled().await?;
        println!("[result] {} -> {data}", query.query_key());
    }

    let create = Arc::new(MutationHandle::new("create", |input: Value| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(json!({ "id": 42, "title": input["title"].clone() }))
    }));
    let publish = Arc::new(MutationHandle::new("publish", |input: Value| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!({ "published": input["id"].clone() }))
    }));

    let mut compute: HashMap<String, ComputeVariablesFn> = HashMap::new();
    compute.insert(
        "create".to_string(),
        Arc::new(|_: Option<&Value>| json!({ "title": "hello" })),
    );
    compute.insert(
        "publish".to_string(),
        Arc::new(|prev: Option<&Value>| json!({ "id": prev.map(|p| p["id"].clone()) })),
    );

    let chain = ChainedMutations::new(
        vec![create as Arc<dyn Mutation>, publish.clone() as Arc<dyn Mutation>],
        compute,
    );
    chain.mutate();
    chain.run().await.into_result()?;
    println!("[chain] completed: {:?}", publish.data());

    Ok(())
}
