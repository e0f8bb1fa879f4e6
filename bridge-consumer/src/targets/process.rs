use async_trait::async_trait;
use bridge_common::config::ProcessTargetConfig;
use bridge_common::delivery::Delivery;
use bytes::Bytes;
use tokio::process::Command;
use tracing::error;

use crate::error::TargetError;
use crate::targets::Target;

/// Runs `<cmd> <routing_key> <body>` per message. Stdout becomes the
/// pipeline response; any stderr output fails the attempt.
pub struct ProcessTarget {
    config: ProcessTargetConfig,
}

impl ProcessTarget {
    pub fn new(config: ProcessTargetConfig) -> Self {
        ProcessTarget { config }
    }
}

#[async_trait]
impl Target for ProcessTarget {
    async fn handle(&self, delivery: &Delivery) -> Result<Option<Bytes>, TargetError> {
        // `php /tmp/fn.php` splits into the program and its leading args; the
        // routing key and body are appended per message.
        let mut parts = self.config.cmd.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| TargetError::Fatal("process target has an empty cmd".to_owned()))?;

        let body = String::from_utf8_lossy(&delivery.body).into_owned();
        let mut command = Command::new(program);
        command
            .args(parts)
            .arg(&delivery.routing_key)
            .arg(&body);

        let output = match tokio::time::timeout(self.config.timeout, command.output()).await {
            Err(_) => {
                error!(cmd = %self.config.cmd, "process execution timed out");
                return Err(TargetError::Transient("process execution timed out".to_owned()));
            }
            Ok(Err(err)) => {
                error!(error = %err, cmd = %self.config.cmd, "failed to spawn the process");
                return Err(TargetError::Transient("failed to execute the process".to_owned()));
            }
            Ok(Ok(output)) => output,
        };

        if !output.stderr.is_empty() {
            error!(
                cmd = %self.config.cmd,
                message.routing_key = %delivery.routing_key,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "process wrote to stderr"
            );
            return Err(TargetError::Transient("failed to execute the process".to_owned()));
        }

        if output.stdout.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Bytes::from(output.stdout)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bridge_common::delivery::Headers;

    use super::*;

    fn delivery() -> Delivery {
        Delivery {
            routing_key: "lo.update".to_owned(),
            body: Bytes::from_static(br#"{"id":555}"#),
            headers: Headers::new(),
            redelivered: false,
            delivery_tag: 1,
            content_type: None,
        }
    }

    fn target(cmd: &str, timeout: Duration) -> ProcessTarget {
        ProcessTarget::new(ProcessTargetConfig {
            cmd: cmd.to_owned(),
            timeout,
        })
    }

    #[tokio::test]
    async fn stdout_becomes_the_response() {
        let response = target("echo", Duration::from_secs(5))
            .handle(&delivery())
            .await
            .unwrap()
            .expect("echo should produce output");

        assert_eq!(
            String::from_utf8_lossy(&response),
            "lo.update {\"id\":555}\n"
        );
    }

    #[tokio::test]
    async fn stderr_fails_the_attempt() {
        let result = target("ls /definitely-not-a-real-path", Duration::from_secs(5))
            .handle(&delivery())
            .await;

        assert!(matches!(result, Err(TargetError::Transient(_))));
    }

    #[tokio::test]
    async fn deadline_exceeded_fails_the_attempt() {
        let result = target("sleep 5", Duration::from_millis(50))
            .handle(&delivery())
            .await;

        assert!(matches!(result, Err(TargetError::Transient(_))));
    }
}
