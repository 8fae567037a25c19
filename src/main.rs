// Copyright Istio Authors
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

use std::sync::Arc;

use anyhow::Context;
use kubeenv::resolver::{Request, Resolver};
use kubeenv::workload_ref::WorkloadRef;
use kubeenv::*;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use tracing::{Level, debug, info};

fn main() -> anyhow::Result<()> {
    telemetry::setup_logging();

    // For now we don't need a complex CLI, so rather than pull in dependencies just use basic argv[1]
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match args.first().map(String::as_str) {
        None | Some("serve") => Command::Serve,
        Some("resolve") => match &args[1..] {
            [source, destination] => Command::Resolve {
                source: source.parse()?,
                destination: destination.parse()?,
            },
            _ => {
                eprintln!("usage: kubeenv resolve <source> <destination>");
                std::process::exit(2)
            }
        },
        Some("version") => return version(),
        Some("help") => return help(),
        Some(unknown) => {
            eprintln!("unknown command: {unknown}");
            help()?;
            std::process::exit(1)
        }
    };

    let cfg = config::parse_config()?;
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async move {
            match command {
                Command::Serve => serve(cfg).await,
                Command::Resolve {
                    source,
                    destination,
                } => resolve(cfg, source, destination).await,
            }
        })
}

enum Command {
    Serve,
    Resolve {
        source: WorkloadRef,
        destination: WorkloadRef,
    },
}

fn help() -> anyhow::Result<()> {
    let version = version::BuildInfo::new();
    println!(
        "
Kubernetes workload resolver ({version})

Commands:
serve (default)           - Synchronize the pod cache until SIGINT/SIGTERM
resolve <source> <dest>   - Resolve one source/destination pair and print the attributes as JSON
version                   - Print the version of kubeenv
help                      - Print commands and version of kubeenv

References are pod uids (kubernetes://<name>.<namespace>) or IP addresses."
    );
    Ok(())
}

fn version() -> anyhow::Result<()> {
    println!("{}", version::BuildInfo::new());
    Ok(())
}

async fn serve(cfg: config::Config) -> anyhow::Result<()> {
    info!("version: {}", version::BuildInfo::new());
    info!("running with config: {}", serde_yaml::to_string(&cfg)?);

    let mut registry = Registry::default();
    let metrics = Arc::new(metrics::Metrics::from(&mut registry));
    let resolver =
        Resolver::new_with_metrics(cfg, &client::local_client_factory, metrics).await?;
    info!(num_pods = resolver.cache().len(), "serving");
    if tracing::enabled!(Level::DEBUG) {
        debug!("pod cache: {}", resolver.cache().dump()?);
    }

    signal::shutdown().await?;

    let mut buf = String::new();
    encode(&mut buf, &registry).context("encoding metrics")?;
    debug!("final metrics:\n{buf}");
    Ok(())
}

async fn resolve(
    cfg: config::Config,
    source: WorkloadRef,
    destination: WorkloadRef,
) -> anyhow::Result<()> {
    let resolver = Resolver::new(cfg, &client::local_client_factory).await?;
    let out = resolver.resolve(&Request {
        source: Some(source),
        destination: Some(destination),
        origin: None,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
