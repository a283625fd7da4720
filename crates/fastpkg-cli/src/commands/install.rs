use super::ErrorInfo;
use fastpkg_core::paths::project_root;
use fastpkg_core::pkg::{
    install_project, read_previous_graph, run_install, write_graph, DepKind, InstallContext,
    InstallReport, PackageSpec, PkgError,
};
use fastpkg_core::InstallConfig;
use miette::{IntoDiagnostic, Result};
use serde::Serialize;
use std::path::Path;
use tracing::warn;

/// Arguments of `fastpkg install`.
#[derive(Debug, Clone, Default)]
pub struct InstallArgs {
    pub specs: Vec<String>,
    pub registry: Option<String>,
    pub no_cache: bool,
    pub concurrency: Option<usize>,
    pub dev: bool,
    pub no_optional: bool,
}

#[derive(Serialize)]
struct InstallJsonResult {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    install: Option<InstallReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorInfo>,
}

pub fn run(cwd: &Path, args: &InstallArgs, json: bool) -> Result<()> {
    let project_dir = if args.specs.is_empty() {
        project_root(cwd).unwrap_or_else(|| cwd.to_path_buf())
    } else {
        cwd.to_path_buf()
    };
    let config = build_config(&project_dir, args)?;

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    let result = runtime.block_on(install(config, &args.specs, &project_dir));

    match result {
        Ok(report) => {
            if json {
                let output = InstallJsonResult {
                    ok: true,
                    install: Some(report),
                    error: None,
                };
                println!("{}", serde_json::to_string_pretty(&output).into_diagnostic()?);
            } else {
                print_summary(&report);
            }
            Ok(())
        }
        Err(e) => {
            if json {
                let output = InstallJsonResult {
                    ok: false,
                    install: None,
                    error: Some(ErrorInfo::from(&e)),
                };
                println!("{}", serde_json::to_string_pretty(&output).into_diagnostic()?);
                std::process::exit(1);
            }
            Err(miette::miette!("{e}"))
        }
    }
}

fn build_config(project_dir: &Path, args: &InstallArgs) -> Result<InstallConfig> {
    let mut config = InstallConfig::load(project_dir).into_diagnostic()?;
    if let Some(url) = &args.registry {
        config = config.with_registry(url).into_diagnostic()?;
    }
    if args.no_cache {
        config = config.with_cache(false);
    }
    if let Some(concurrency) = args.concurrency {
        config = config.with_concurrency(concurrency);
    }
    let include_optional = config.include_optional && !args.no_optional;
    Ok(config
        .with_include_dev(args.dev)
        .with_include_optional(include_optional))
}

async fn install(
    config: InstallConfig,
    specs: &[String],
    project_dir: &Path,
) -> Result<InstallReport, PkgError> {
    let roots = specs
        .iter()
        .map(|s| PackageSpec::parse(s).map(|spec| (spec, DepKind::Prod)))
        .collect::<Result<Vec<_>, _>>()?;

    let ctx = InstallContext::new(config)?;

    // Ctrl-C cancels in-flight work instead of killing the process mid-write.
    let cancel = ctx.cancel().clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling install");
            cancel.cancel();
        }
    });

    let previous = read_previous_graph(project_dir);
    let result = if roots.is_empty() {
        install_project(&ctx, project_dir, previous.as_ref()).await
    } else {
        run_install(&ctx, &roots, project_dir, previous.as_ref()).await
    };
    interrupt.abort();

    let report = result?;
    if let Err(e) = write_graph(project_dir, &report.graph) {
        warn!("{e}");
    }
    Ok(report)
}

fn print_summary(report: &InstallReport) {
    for edge in &report.graph.roots {
        let node = report.graph.node(edge.target);
        println!("+ {node}");
    }
    println!(
        "{} packages installed ({} extracted, {} unchanged; {} downloaded, {} from cache)",
        report.graph.len(),
        report.outcome.extracted,
        report.outcome.unchanged,
        report.downloaded,
        report.cache_hits,
    );
    for cycle in &report.graph.cycles {
        let names: Vec<String> = cycle
            .iter()
            .map(|id| report.graph.node(*id).to_string())
            .collect();
        println!("cycle: {}", names.join(" -> "));
    }
}
