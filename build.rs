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

use std::path::Path;
use std::process::Command;

// This build script stamps the build information reported by `kubeenv version`.
// Release tooling may set any of the KUBEENV_BUILD_* variables; otherwise they are
// derived from git, falling back to placeholders outside a checkout.
fn main() -> Result<(), anyhow::Error> {
    let stamp = |key: &str, default: String| {
        let var = format!("KUBEENV_BUILD_{key}");
        println!("cargo:rerun-if-env-changed={var}");
        let value = std::env::var(&var).unwrap_or(default);
        println!("cargo:rustc-env={var}={value}");
    };
    if Path::new(".git/HEAD").exists() {
        println!("cargo:rerun-if-changed=.git/HEAD");
        println!("cargo:rerun-if-changed=.git/index");
    }

    let status = match git(&["status", "--porcelain"]) {
        Some(out) if out.is_empty() => "Clean",
        Some(_) => "Modified",
        None => "unknown",
    };

    stamp("buildVersion", std::env::var("CARGO_PKG_VERSION")?);
    stamp(
        "buildGitRevision",
        non_empty(git(&["rev-parse", "HEAD"])).unwrap_or_else(|| "unknown".to_string()),
    );
    stamp("buildStatus", status.to_string());
    stamp(
        "buildTag",
        non_empty(git(&["describe", "--tags", "--always"]))
            .unwrap_or_else(|| "unknown".to_string()),
    );
    stamp("RUSTC_VERSION", rustc_version::version()?.to_string());

    Ok(())
}

/// Runs git and returns its trimmed stdout, or None if git is missing or fails.
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}
