//! Idempotent CloudFormation stack management
//!
//! Stack existence is modeled as an explicit state ([`StackState`]) read
//! from `DescribeStacks` rather than inferred from call failures, so a
//! stack stuck in a rollback state surfaces as an error naming the real
//! status instead of being retried blindly.

use crate::{
    aws::POLL_INTERVAL,
    error::Error,
};
use aws_sdk_cloudformation::{
    error::ProvideErrorMetadata,
    types::{Capability, Parameter},
    Client,
};
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, info};
use uuid::Uuid;

/// How long to wait for a stack operation to reach a terminal state
const STACK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Observed state of a named stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackState {
    /// No stack with this name exists
    Absent,
    /// An operation is in flight
    InProgress(String),
    /// The stack is usable and can be updated
    Complete(String),
    /// The stack is in a state that requires operator intervention
    Failed(String),
}

/// Maps a CloudFormation status string onto a [`StackState`]
pub fn classify(status: &str) -> StackState {
    match status {
        "DELETE_COMPLETE" => StackState::Absent,
        "CREATE_COMPLETE" | "UPDATE_COMPLETE" | "IMPORT_COMPLETE" => {
            StackState::Complete(status.to_string())
        }
        s if s.ends_with("_IN_PROGRESS") => StackState::InProgress(status.to_string()),
        s => StackState::Failed(s.to_string()),
    }
}

/// Reads the current state of a stack
pub async fn stack_state(client: &Client, stack: &str) -> Result<StackState, Error> {
    match client.describe_stacks().stack_name(stack).send().await {
        Ok(resp) => {
            let status = resp
                .stacks()
                .first()
                .map(|s| s.stack_status().as_str().to_string());
            match status {
                Some(status) => Ok(classify(&status)),
                None => Ok(StackState::Absent),
            }
        }
        Err(e) => {
            let service_err = e.into_service_error();
            if service_err
                .message()
                .is_some_and(|m| m.contains("does not exist"))
            {
                return Ok(StackState::Absent);
            }
            Err(Error::AwsCloudFormation {
                stack: stack.to_string(),
                operation: "DescribeStacks",
                source: Box::new(aws_sdk_cloudformation::Error::from(service_err)),
            })
        }
    }
}

/// Polls until the stack leaves every `_IN_PROGRESS` status
async fn wait_until_terminal(client: &Client, stack: &str) -> Result<StackState, Error> {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = std::time::Instant::now();
    loop {
        interval.tick().await;
        if start.elapsed() > STACK_TIMEOUT {
            return Err(Error::WaitTimeout {
                what: format!("stack {stack}"),
            });
        }
        let state = stack_state(client, stack).await?;
        match &state {
            StackState::InProgress(status) => {
                debug!(
                    stack,
                    status = status.as_str(),
                    elapsed_secs = start.elapsed().as_secs(),
                    "stack operation in progress"
                );
            }
            _ => return Ok(state),
        }
    }
}

/// Builds the CloudFormation parameter list from key/value pairs
pub fn build_parameters(parameters: &[(&str, String)]) -> Vec<Parameter> {
    parameters
        .iter()
        .map(|(key, value)| {
            Parameter::builder()
                .parameter_key(*key)
                .parameter_value(value)
                .build()
        })
        .collect()
}

/// Renders the parameter list as the JSON document mirrored to disk
pub fn parameters_json(parameters: &[(&str, String)]) -> String {
    let entries: Vec<serde_json::Value> = parameters
        .iter()
        .map(|(key, value)| {
            serde_json::json!({
                "ParameterKey": key,
                "ParameterValue": value,
            })
        })
        .collect();
    serde_json::Value::Array(entries).to_string()
}

/// Creates or updates a stack and blocks until it settles, returning its
/// outputs.
///
/// A stack that already matches the template reports "No updates are to be
/// performed"; that is success. A stack in a rollback or failed state is a
/// hard error: recovering it is an operator decision.
pub async fn ensure_stack(
    client: &Client,
    stack: &str,
    template_url: &str,
    parameters: &[(&str, String)],
) -> Result<BTreeMap<String, String>, Error> {
    let mut state = stack_state(client, stack).await?;
    if let StackState::InProgress(status) = &state {
        info!(
            stack,
            status = status.as_str(),
            "stack has an operation in flight, waiting for it to settle"
        );
        state = wait_until_terminal(client, stack).await?;
    }

    match state {
        StackState::Absent => {
            info!(stack, "creating stack");
            client
                .create_stack()
                .stack_name(stack)
                .template_url(template_url)
                .set_parameters(Some(build_parameters(parameters)))
                .capabilities(Capability::CapabilityNamedIam)
                .disable_rollback(true)
                .client_request_token(Uuid::new_v4().to_string())
                .send()
                .await
                .map_err(|e| Error::AwsCloudFormation {
                    stack: stack.to_string(),
                    operation: "CreateStack",
                    source: Box::new(aws_sdk_cloudformation::Error::from(e.into_service_error())),
                })?;
        }
        StackState::Complete(status) => {
            info!(stack, status = status.as_str(), "updating existing stack");
            let update = client
                .update_stack()
                .stack_name(stack)
                .template_url(template_url)
                .set_parameters(Some(build_parameters(parameters)))
                .capabilities(Capability::CapabilityNamedIam)
                .client_request_token(Uuid::new_v4().to_string())
                .send()
                .await;
            if let Err(e) = update {
                let service_err = e.into_service_error();
                if service_err
                    .message()
                    .is_some_and(|m| m.contains("No updates are to be performed"))
                {
                    info!(stack, "stack already up to date");
                    return stack_outputs(client, stack).await;
                }
                return Err(Error::AwsCloudFormation {
                    stack: stack.to_string(),
                    operation: "UpdateStack",
                    source: Box::new(aws_sdk_cloudformation::Error::from(service_err)),
                });
            }
        }
        StackState::Failed(status) => {
            return Err(Error::StackUnexpectedState {
                stack: stack.to_string(),
                status,
            });
        }
        StackState::InProgress(status) => {
            // Unreachable after the settle above, but the state is explicit
            return Err(Error::StackUnexpectedState {
                stack: stack.to_string(),
                status,
            });
        }
    }

    match wait_until_terminal(client, stack).await? {
        StackState::Complete(status) => {
            info!(stack, status = status.as_str(), "stack operation complete");
            stack_outputs(client, stack).await
        }
        StackState::Absent => Err(Error::StackOperationFailed {
            stack: stack.to_string(),
            status: "DELETE_COMPLETE".to_string(),
        }),
        StackState::Failed(status) => Err(Error::StackOperationFailed {
            stack: stack.to_string(),
            status,
        }),
        StackState::InProgress(status) => Err(Error::StackUnexpectedState {
            stack: stack.to_string(),
            status,
        }),
    }
}

/// Reads the output map of a settled stack
pub async fn stack_outputs(
    client: &Client,
    stack: &str,
) -> Result<BTreeMap<String, String>, Error> {
    let resp = client
        .describe_stacks()
        .stack_name(stack)
        .send()
        .await
        .map_err(|e| Error::AwsCloudFormation {
            stack: stack.to_string(),
            operation: "DescribeStacks",
            source: Box::new(aws_sdk_cloudformation::Error::from(e.into_service_error())),
        })?;
    let mut outputs = BTreeMap::new();
    if let Some(description) = resp.stacks().first() {
        for output in description.outputs() {
            if let (Some(key), Some(value)) = (output.output_key(), output.output_value()) {
                outputs.insert(key.to_string(), value.to_string());
            }
        }
    }
    Ok(outputs)
}

/// Extracts a required output, failing with the stack and key names
pub fn require_output(
    outputs: &BTreeMap<String, String>,
    stack: &str,
    key: &str,
) -> Result<String, Error> {
    outputs
        .get(key)
        .cloned()
        .ok_or_else(|| Error::StackOutputMissing {
            stack: stack.to_string(),
            output: key.to_string(),
        })
}

/// Deletes a stack and waits for it to disappear; an absent stack is a
/// logged no-op
pub async fn delete_stack(client: &Client, stack: &str) -> Result<(), Error> {
    match stack_state(client, stack).await? {
        StackState::Absent => {
            info!(stack, "stack does not exist, nothing to delete");
            return Ok(());
        }
        StackState::InProgress(status) => {
            info!(
                stack,
                status = status.as_str(),
                "waiting for in-flight operation before deleting"
            );
            wait_until_terminal(client, stack).await?;
        }
        _ => {}
    }

    info!(stack, "deleting stack");
    client
        .delete_stack()
        .stack_name(stack)
        .client_request_token(Uuid::new_v4().to_string())
        .send()
        .await
        .map_err(|e| Error::AwsCloudFormation {
            stack: stack.to_string(),
            operation: "DeleteStack",
            source: Box::new(aws_sdk_cloudformation::Error::from(e.into_service_error())),
        })?;

    match wait_until_terminal(client, stack).await? {
        StackState::Absent => {
            info!(stack, "stack deleted");
            Ok(())
        }
        StackState::Complete(status) | StackState::Failed(status) => {
            Err(Error::StackOperationFailed {
                stack: stack.to_string(),
                status,
            })
        }
        StackState::InProgress(status) => Err(Error::StackUnexpectedState {
            stack: stack.to_string(),
            status,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_complete_states() {
        assert_eq!(
            classify("CREATE_COMPLETE"),
            StackState::Complete("CREATE_COMPLETE".to_string())
        );
        assert_eq!(
            classify("UPDATE_COMPLETE"),
            StackState::Complete("UPDATE_COMPLETE".to_string())
        );
    }

    #[test]
    fn test_classify_delete_complete_is_absent() {
        assert_eq!(classify("DELETE_COMPLETE"), StackState::Absent);
    }

    #[test]
    fn test_classify_in_progress_states() {
        for status in [
            "CREATE_IN_PROGRESS",
            "UPDATE_IN_PROGRESS",
            "DELETE_IN_PROGRESS",
            "UPDATE_COMPLETE_CLEANUP_IN_PROGRESS",
            "UPDATE_ROLLBACK_IN_PROGRESS",
        ] {
            assert_eq!(
                classify(status),
                StackState::InProgress(status.to_string()),
                "{status}"
            );
        }
    }

    #[test]
    fn test_classify_rollback_states_are_failures() {
        for status in [
            "ROLLBACK_COMPLETE",
            "ROLLBACK_FAILED",
            "CREATE_FAILED",
            "DELETE_FAILED",
            "UPDATE_ROLLBACK_COMPLETE",
            "UPDATE_ROLLBACK_FAILED",
        ] {
            assert!(
                matches!(classify(status), StackState::Failed(_)),
                "{status}"
            );
        }
    }

    #[test]
    fn test_parameters_json_shape() {
        let rendered = parameters_json(&[
            ("VpcCidr", "10.42.0.0/16".to_string()),
            ("BucketName", "demo-logs".to_string()),
        ]);
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        let entries = parsed.as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["ParameterKey"], "VpcCidr");
        assert_eq!(entries[0]["ParameterValue"], "10.42.0.0/16");
    }

    #[test]
    fn test_build_parameters_preserves_order() {
        let params = build_parameters(&[("A", "1".to_string()), ("B", "2".to_string())]);
        assert_eq!(params[0].parameter_key(), Some("A"));
        assert_eq!(params[1].parameter_value(), Some("2"));
    }

    #[test]
    fn test_require_output_missing_names_stack_and_key() {
        let outputs = BTreeMap::new();
        let err = require_output(&outputs, "demo-network", "VpcId").unwrap_err();
        assert!(matches!(
            err,
            Error::StackOutputMissing { stack, output }
                if stack == "demo-network" && output == "VpcId"
        ));
    }
}
