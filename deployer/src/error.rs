//! Error type shared by every stage and AWS wrapper

use thiserror::Error;

/// Errors that can occur while deploying or destroying the platform
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to build AWS request: {0}")]
    RequestBuild(#[from] aws_sdk_s3::error::BuildError),
    #[error("required tool not found on PATH: {0}")]
    ToolMissing(String),
    #[error("command `{command}` failed: {detail}")]
    CommandFailed { command: String, detail: String },
    #[error("{what} not found")]
    ResourceNotFound { what: String },
    #[error("ambiguous match for {what}: {candidates:?}")]
    AmbiguousResource {
        what: String,
        candidates: Vec<String>,
    },
    #[error("stack {stack} is in state {status}; resolve it manually before retrying")]
    StackUnexpectedState { stack: String, status: String },
    #[error("stack {stack} operation ended in {status}")]
    StackOperationFailed { stack: String, status: String },
    #[error("stack {stack} is missing output {output}")]
    StackOutputMissing { stack: String, output: String },
    #[error("timed out waiting for {what}")]
    WaitTimeout { what: String },
    #[error("AWS STS {operation} failed: {source}")]
    AwsSts {
        operation: &'static str,
        source: Box<aws_sdk_sts::Error>,
    },
    #[error("AWS CloudFormation {operation} failed for stack {stack}: {source}")]
    AwsCloudFormation {
        stack: String,
        operation: &'static str,
        source: Box<aws_sdk_cloudformation::Error>,
    },
    #[error("AWS EC2 {operation} failed: {source}")]
    AwsEc2 {
        operation: &'static str,
        source: Box<aws_sdk_ec2::Error>,
    },
    #[error("AWS S3 {operation} failed for bucket {bucket}: {source}")]
    AwsS3 {
        bucket: String,
        operation: &'static str,
        source: Box<aws_sdk_s3::Error>,
    },
    #[error("AWS EKS {operation} failed for cluster {cluster}: {source}")]
    AwsEks {
        cluster: String,
        operation: &'static str,
        source: Box<aws_sdk_eks::Error>,
    },
    #[error("AWS IAM {operation} failed for {entity}: {source}")]
    AwsIam {
        entity: String,
        operation: &'static str,
        source: Box<aws_sdk_iam::Error>,
    },
    #[error("AWS EMR containers {operation} failed: {source}")]
    AwsEmrContainers {
        operation: &'static str,
        source: Box<aws_sdk_emrcontainers::Error>,
    },
    #[error("AWS ECR {operation} failed for repository {repository}: {source}")]
    AwsEcr {
        repository: String,
        operation: &'static str,
        source: Box<aws_sdk_ecr::Error>,
    },
    #[error("AWS ACM {operation} failed: {source}")]
    AwsAcm {
        operation: &'static str,
        source: Box<aws_sdk_acm::Error>,
    },
    #[error("AWS ACM PCA {operation} failed: {source}")]
    AwsAcmPca {
        operation: &'static str,
        source: Box<aws_sdk_acmpca::Error>,
    },
    #[error("AWS Route 53 {operation} failed: {source}")]
    AwsRoute53 {
        operation: &'static str,
        source: Box<aws_sdk_route53::Error>,
    },
    #[error("AWS ELBv2 {operation} failed: {source}")]
    AwsElb {
        operation: &'static str,
        source: Box<aws_sdk_elasticloadbalancingv2::Error>,
    },
}
