use crate::commands::{with_database, CommandResult};

pub fn run() -> CommandResult {
    match with_database(|_config, _pool| async { Ok(()) }) {
        Ok(()) => CommandResult::success("migrate", "applied pending migrations"),
        Err(failure) => CommandResult::from_failure("migrate", failure),
    }
}
