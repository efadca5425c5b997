use std::time::Duration;

use blobsync_core::instrument::Step;
use blobsync_core::job::RunReport;
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, Color, ContentArrangement, Table};

/// One row per pipeline step: completed, failed, or not reached.
pub fn render(report: &RunReport) -> Table {
    let outcomes = report.run.outcomes();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["#", "Step", "Status", "Elapsed", "Detail"]);

    for step in Step::ALL {
        let outcome = outcomes.iter().find(|outcome| outcome.step == step);
        let (status, elapsed, detail) = match outcome {
            Some(outcome) => match &outcome.error {
                None => (Cell::new("ok").fg(Color::Green), format_elapsed(outcome.elapsed), String::new()),
                Some(error) => (
                    Cell::new("failed").fg(Color::Red),
                    format_elapsed(outcome.elapsed),
                    error.clone(),
                ),
            },
            None => (Cell::new("skipped").fg(Color::DarkGrey), "-".to_string(), String::new()),
        };

        table.add_row(vec![
            Cell::new(step.ordinal()),
            Cell::new(step.name()),
            status,
            Cell::new(elapsed),
            Cell::new(detail),
        ]);
    }

    table
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.2}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_switches_to_seconds() {
        assert_eq!(format_elapsed(Duration::from_millis(42)), "42ms");
        assert_eq!(format_elapsed(Duration::from_millis(1500)), "1.50s");
    }
}
