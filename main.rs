/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::path::PathBuf;
use std::process::ExitCode;

use bpaf::Bpaf;
use prerender::replay::{self, ReplayReport, Scenario};
use prerender::PrerenderConfig;

/// Replays a scripted prerender session and reports every attempt's outcome.
#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, version)]
struct ReplayOptions {
    /// TOML configuration file, overridden by PRERENDER_* variables
    #[bpaf(long, short, argument("PATH"))]
    config: Option<PathBuf>,
    /// Tracing filter directives, e.g. "prerender=debug"
    #[bpaf(long, argument("FILTER"))]
    tracing_filter: Option<String>,
    /// Print the full report as JSON
    #[bpaf(long)]
    json: bool,
    /// Scenario to replay
    #[bpaf(positional("SCENARIO"))]
    scenario: PathBuf,
}

fn main() -> ExitCode {
    let options = replay_options().run();
    prerender::init_tracing(options.tracing_filter.as_deref());
    #[cfg(feature = "tracing")]
    let _span = tracing::info_span!("replay", scenario = %options.scenario.display()).entered();

    let config = match PrerenderConfig::load(options.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration: {e}");
            return ExitCode::from(2);
        }
    };

    let report = match Scenario::load(&options.scenario).and_then(|s| replay::run(&s, config)) {
        Ok(report) => report,
        Err(e) => {
            log::error!("{}: {e}", options.scenario.display());
            return ExitCode::FAILURE;
        }
    };

    if options.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                log::error!("failed to serialize report: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        print_summary(&report);
    }
    ExitCode::SUCCESS
}

fn print_summary(report: &ReplayReport) {
    for attempt in &report.attempts {
        let id = attempt
            .attempt
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        let status = match (attempt.final_status, attempt.state) {
            (Some(status), _) => status.to_string(),
            (None, Some(state)) => format!("live ({state:?})"),
            (None, None) => attempt.submitted.clone(),
        };
        println!("{:<16} {:<12} {:<40} {status}", attempt.name, id, attempt.url);
    }
    for navigation in &report.navigations {
        println!(
            "{} -> {} [{}]",
            navigation.navigation,
            navigation.url,
            navigation.committed.as_deref().unwrap_or("not committed")
        );
    }
    println!("primary: {}", report.primary_url);
}
