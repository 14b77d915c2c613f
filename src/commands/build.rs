use crate::evaluator::EnvironmentDescriptor;
use crate::platform::PlatformId;
use crate::{ui, Workspace};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Outcome<'a> {
    Ok {
        descriptor: &'a EnvironmentDescriptor,
    },
    Error {
        kind: &'static str,
        message: String,
    },
}

pub fn execute(workspace: &Workspace, name: &str, platforms: &[String], json: bool) -> Result<()> {
    let manifest = workspace.load_manifest()?;
    let requested = manifest.shell(name)?.packages.clone();
    let session = workspace.session(&manifest, &[])?;

    let platforms = if platforms.is_empty() {
        session.systems().to_vec()
    } else {
        platforms
            .iter()
            .map(|value| {
                PlatformId::parse(value).with_context(|| format!("Invalid --platform '{value}'"))
            })
            .collect::<Result<Vec<_>>>()?
    };

    let report = session.driver().build_all(&platforms, &requested);

    if json {
        let outcomes: BTreeMap<&str, Outcome<'_>> = report
            .iter()
            .map(|(platform, result)| {
                let outcome = match result {
                    Ok(descriptor) => Outcome::Ok { descriptor },
                    Err(err) => Outcome::Error {
                        kind: err.kind(),
                        message: err.to_string(),
                    },
                };
                (platform.as_str(), outcome)
            })
            .collect();
        let rendered =
            serde_json::to_string_pretty(&outcomes).context("Failed to serialize build report")?;
        println!("{rendered}");
    } else {
        for (platform, result) in report.iter() {
            match result {
                Ok(descriptor) => {
                    ui::success(
                        platform.as_str(),
                        format!("{} package(s)", descriptor.packages.len()),
                    );
                    for package in &descriptor.packages {
                        println!(
                            "{:>12} {} {} {}",
                            "",
                            package.name,
                            package.version,
                            package.out_path.display()
                        );
                    }
                }
                Err(err) => ui::error(format!("{platform}: {err}")),
            }
        }
    }

    let failed = report.failures().count();
    if failed > 0 {
        anyhow::bail!(
            "Shell '{name}' failed on {failed} of {} platform(s).",
            report.len()
        );
    }

    Ok(())
}
