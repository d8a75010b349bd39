use crate::commands::{with_database, CommandResult, Failure};
use signoff_db::fixtures::FlowSeedInfo;
use signoff_db::DemoSeedDataset;

pub fn run() -> CommandResult {
    let result = with_database(|_config, pool| async move {
        let seed_result = DemoSeedDataset::load(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;

        let verification = DemoSeedDataset::verify(&pool)
            .await
            .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

        if !verification.all_present {
            let failed = verification
                .checks
                .iter()
                .filter_map(|(check, passed)| (!passed).then_some(*check))
                .collect::<Vec<_>>();
            return Err(("seed_verification", verification_message(&failed), 6u8));
        }

        Ok::<_, Failure>(SeedOutput {
            flows: seed_result.flows_seeded,
            targets: seed_result.targets_seeded,
        })
    });

    match result {
        Ok(output) => {
            let flow_lines = output
                .flows
                .iter()
                .map(|flow| format!("  - {} [{}]: {}", flow.flow_id, flow.target_type, flow.description))
                .collect::<Vec<_>>();
            let message = format!(
                "demo approval flows loaded:\n{}\ndraft records: {}",
                flow_lines.join("\n"),
                output.targets.join(", ")
            );
            CommandResult::success("seed", message)
        }
        Err(failure) => CommandResult::from_failure("seed", failure),
    }
}

struct SeedOutput {
    flows: Vec<FlowSeedInfo>,
    targets: Vec<&'static str>,
}

fn verification_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "some seed data failed to load".to_string()
    } else {
        format!("seed verification failed for checks: {}", failed_checks.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::verification_message;

    #[test]
    fn verification_error_message_targets_failed_checks() {
        assert_eq!(
            verification_message(&["flow-po-standard", "Q-2026-0002"]),
            "seed verification failed for checks: flow-po-standard, Q-2026-0002"
        );
    }

    #[test]
    fn verification_error_message_falls_back_to_generic_when_no_labels() {
        assert_eq!(verification_message(&[]), "some seed data failed to load");
    }
}
