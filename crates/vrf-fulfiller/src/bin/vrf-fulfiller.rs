// Copyright 2026 Boundless Foundation, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use alloy::{
    providers::ProviderBuilder,
    rpc::client::RpcClient,
    transports::{
        http::Http,
        layers::{FallbackLayer, RetryBackoffLayer},
    },
};
use anyhow::{Context, Result};
use clap::Parser;
use tower::ServiceBuilder;
use tracing_subscriber::fmt::format::FmtSpan;
use url::Url;
use vrf_fulfiller::{config::ConfigWatcher, Args, CustomRetryPolicy, FulfillerService};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let all_rpc_urls = collect_rpc_urls(args.rpc_url.clone(), args.rpc_urls.clone())?;

    if args.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_span_events(FmtSpan::CLOSE)
            .json()
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_span_events(FmtSpan::CLOSE)
            .init();
    }

    let config_watcher = ConfigWatcher::new(&args.config_file)
        .await
        .context("Failed to load fulfiller config")?;

    let retry_layer = RetryBackoffLayer::new_with_policy(
        args.rpc_retry_max,
        args.rpc_retry_backoff,
        args.rpc_retry_cu,
        CustomRetryPolicy,
    );

    let client = if all_rpc_urls.len() > 1 {
        let transports: Vec<Http<_>> =
            all_rpc_urls.iter().map(|url| Http::new(url.clone())).collect();

        let active_count =
            std::num::NonZeroUsize::new(transports.len()).unwrap_or(std::num::NonZeroUsize::MIN);
        let fallback_layer = FallbackLayer::default().with_active_transport_count(active_count);

        tracing::info!(
            "Configuring fulfiller with fallback RPC support: {} URLs: {:?}",
            all_rpc_urls.len(),
            all_rpc_urls
        );

        let transport =
            ServiceBuilder::new().layer(retry_layer).layer(fallback_layer).service(transports);

        RpcClient::builder().transport(transport, false)
    } else {
        let single_url = &all_rpc_urls[0];
        tracing::info!("Configuring fulfiller with single RPC URL: {}", single_url);
        RpcClient::builder().layer(retry_layer).http(single_url.clone())
    };

    // Read-only provider, transactions are handed to the tx manager store
    let provider = ProviderBuilder::new().disable_recommended_fillers().connect_client(client);

    let fulfiller = FulfillerService::new(args, provider, config_watcher).await?;
    fulfiller.start_service().await.context("Fulfiller service failed")?;

    Ok(())
}

/// Deduplicated list of RPC URLs from the single and comma separated arguments
fn collect_rpc_urls(rpc_url: Option<String>, rpc_urls: Vec<String>) -> Result<Vec<Url>> {
    let mut all_rpc_urls = std::collections::HashSet::new();

    if let Some(url_str) = rpc_url {
        if !url_str.is_empty() {
            let url = Url::parse(&url_str).context("Invalid VRF_RPC_URL environment variable")?;
            all_rpc_urls.insert(url);
        }
    }

    for url_str in rpc_urls {
        let url_str = url_str.trim();
        if !url_str.is_empty() {
            let url = Url::parse(url_str).context("Invalid VRF_RPC_URLS environment variable")?;
            all_rpc_urls.insert(url);
        }
    }

    if all_rpc_urls.is_empty() {
        anyhow::bail!(
            "No RPC URLs provided. Please set at least one using VRF_RPC_URL or VRF_RPC_URLS environment variables"
        );
    }

    Ok(all_rpc_urls.into_iter().collect())
}
