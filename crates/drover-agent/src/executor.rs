//! Shell command execution with combined output capture.

use std::time::Instant;

use tokio::process::Command;

/// What one execution produced: combined stdout+stderr, the exit code, and
/// wall-clock seconds. Spawn failures report exit code -1 with the error
/// text as output, so the server always receives a result to validate.
#[derive(Clone, Debug)]
pub struct CommandOutcome {
    pub output: String,
    pub exit_code: i32,
    pub duration: f64,
}

pub async fn run_shell(command: &str) -> CommandOutcome {
    let started = Instant::now();

    match Command::new("sh").arg("-c").arg(command).output().await {
        Ok(out) => {
            let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
            output.push_str(&String::from_utf8_lossy(&out.stderr));
            CommandOutcome {
                output,
                exit_code: out.status.code().unwrap_or(-1),
                duration: started.elapsed().as_secs_f64(),
            }
        }
        Err(e) => CommandOutcome {
            output: format!("Error executing command: {e}"),
            exit_code: -1,
            duration: started.elapsed().as_secs_f64(),
        },
    }
}
