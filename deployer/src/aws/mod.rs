//! AWS SDK client construction and account identity

use crate::error::Error;
use aws_config::{retry::RetryConfig, BehaviorVersion, SdkConfig};
pub use aws_config::Region;
use std::time::Duration;

pub mod acm;
pub mod cloudformation;
pub mod eks;
pub mod iam;
pub mod pca;
pub mod resolve;
pub mod route53;
pub mod s3;

/// Interval between polls of a pending AWS resource
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Loads SDK configuration for a region with adaptive retries
pub async fn sdk_config(region: Region) -> SdkConfig {
    let retry = RetryConfig::adaptive()
        .with_max_attempts(10)
        .with_initial_backoff(Duration::from_millis(500))
        .with_max_backoff(Duration::from_secs(30));
    aws_config::defaults(BehaviorVersion::latest())
        .region(region)
        .retry_config(retry)
        .load()
        .await
}

pub fn cloudformation_client(config: &SdkConfig) -> aws_sdk_cloudformation::Client {
    aws_sdk_cloudformation::Client::new(config)
}

pub fn ec2_client(config: &SdkConfig) -> aws_sdk_ec2::Client {
    aws_sdk_ec2::Client::new(config)
}

pub fn s3_client(config: &SdkConfig) -> aws_sdk_s3::Client {
    aws_sdk_s3::Client::new(config)
}

pub fn eks_client(config: &SdkConfig) -> aws_sdk_eks::Client {
    aws_sdk_eks::Client::new(config)
}

pub fn iam_client(config: &SdkConfig) -> aws_sdk_iam::Client {
    aws_sdk_iam::Client::new(config)
}

pub fn emr_client(config: &SdkConfig) -> aws_sdk_emrcontainers::Client {
    aws_sdk_emrcontainers::Client::new(config)
}

pub fn ecr_client(config: &SdkConfig) -> aws_sdk_ecr::Client {
    aws_sdk_ecr::Client::new(config)
}

pub fn acm_client(config: &SdkConfig) -> aws_sdk_acm::Client {
    aws_sdk_acm::Client::new(config)
}

pub fn pca_client(config: &SdkConfig) -> aws_sdk_acmpca::Client {
    aws_sdk_acmpca::Client::new(config)
}

pub fn route53_client(config: &SdkConfig) -> aws_sdk_route53::Client {
    aws_sdk_route53::Client::new(config)
}

pub fn elb_client(config: &SdkConfig) -> aws_sdk_elasticloadbalancingv2::Client {
    aws_sdk_elasticloadbalancingv2::Client::new(config)
}

/// Resolves the AWS account id of the active credentials
pub async fn account_id(config: &SdkConfig) -> Result<String, Error> {
    let client = aws_sdk_sts::Client::new(config);
    let identity = client
        .get_caller_identity()
        .send()
        .await
        .map_err(|e| Error::AwsSts {
            operation: "GetCallerIdentity",
            source: Box::new(aws_sdk_sts::Error::from(e.into_service_error())),
        })?;
    identity
        .account()
        .map(str::to_string)
        .ok_or(Error::ResourceNotFound {
            what: "caller identity account id".to_string(),
        })
}
