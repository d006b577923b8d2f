//! Terminal output for the upgrade flow.

use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::upgrade::UpgradeOutcome;
use crate::upgrade::path::MigrationPath;
use crate::upgrade::steps::MigrationStep;
use crate::version::Version;

/// Row of the migration plan table.
#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "STEP")]
    description: &'static str,
}

/// Print a phase header.
pub fn print_phase(title: &str) {
    println!();
    println!("{}", format!("=== {title} ===").cyan().bold());
}

/// Render the ordered plan as a table.
pub fn render_plan(steps: &[&MigrationStep]) -> String {
    let rows: Vec<StepRow> = steps
        .iter()
        .enumerate()
        .map(|(i, step)| StepRow {
            index: i + 1,
            description: step.description,
        })
        .collect();

    let mut table = Table::new(&rows);
    apply_table_style(&mut table);
    table.to_string()
}

/// Print the migration plan for review before confirmation.
pub fn print_plan(
    release: &str,
    deployed: Version,
    target: Version,
    path: MigrationPath,
    steps: &[&MigrationStep],
) {
    println!();
    println!(
        "{} {} -> {} ({})",
        format!("Release {release}:").bold(),
        deployed,
        target.to_string().green(),
        path
    );

    if steps.is_empty() {
        println!("  No structural migration needed; values are applied as provided.");
        return;
    }

    println!("{}", render_plan(steps));
}

/// Print the final line for a finished run.
pub fn print_outcome(outcome: &UpgradeOutcome) {
    println!();
    match outcome {
        UpgradeOutcome::Installed { release, version } => {
            println!(
                "{} Successfully installed {} at version: {}",
                "✓".green(),
                release.bold(),
                version.green()
            );
        }
        UpgradeOutcome::Upgraded {
            release,
            version,
            path,
            cert_manager_upgraded,
        } => {
            println!(
                "{} Successfully upgraded {} to version: {} ({})",
                "✓".green(),
                release.bold(),
                version.green(),
                path
            );
            if *cert_manager_upgraded {
                println!(
                    "{} cert-manager upgraded to {}",
                    "✓".green(),
                    crate::upgrade::crds::CERT_MANAGER_VERSION
                );
            }
        }
    }
}

fn apply_table_style(table: &mut Table) {
    use tabled::settings::object::Columns;
    use tabled::settings::themes::Theme;
    use tabled::settings::{Modify, Padding};

    let mut theme = Theme::from_style(Style::empty());
    theme.remove_horizontal_lines();
    table.with(theme);
    table.with(Modify::new(Columns::new(..)).with(Padding::new(0, 2, 0, 0)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upgrade::path::MigrationWindow;
    use crate::upgrade::steps;
    use crate::version::MigrationBoundaries;

    #[test]
    fn test_render_plan_lists_steps_in_order() {
        let window = MigrationWindow {
            deployed: Version::parse("0.3.0", 3).unwrap(),
            target: Version::parse("0.9.0", 3).unwrap(),
            boundaries: MigrationBoundaries::standard().unwrap(),
            skip_crds: false,
        };
        let plan = steps::plan(&window);
        let rendered = render_plan(&plan);

        assert!(rendered.contains("STEP"));
        let crds = rendered.find("Apply kube-prometheus CRDs").unwrap();
        let storage = rendered.find("Move Prometheus data").unwrap();
        let tracing = rendered.find("OpenTelemetry collector").unwrap();
        assert!(crds < storage && storage < tracing);
    }
}
