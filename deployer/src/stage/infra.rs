//! Infra stage: templates bucket, network stack, and event-log stack

use crate::{
    aws::{cloudformation, s3},
    config::Config,
    error::Error,
    templates, util,
};
use aws_config::SdkConfig;
use tracing::info;

/// Uploads an embedded template and returns its `TemplateURL`
async fn upload_template(
    client: &aws_sdk_s3::Client,
    bucket: &str,
    region: &str,
    name: &str,
    body: &str,
) -> Result<String, Error> {
    let key = templates::template_s3_key(name, &util::digest(body.as_bytes()));
    s3::upload_if_absent(client, bucket, &key, body.as_bytes().to_vec()).await?;
    Ok(s3::object_url(bucket, region, &key))
}

pub async fn deploy(config: &Config, aws: &SdkConfig, account: &str) -> Result<(), Error> {
    let s3_client = crate::aws::s3_client(aws);
    let bucket = config.templates_bucket(account);
    s3::ensure_bucket_exists(&s3_client, &bucket, &config.region).await?;

    let network_url = upload_template(
        &s3_client,
        &bucket,
        &config.region,
        "network.yaml",
        templates::NETWORK_TEMPLATE,
    )
    .await?;
    let logs_url = upload_template(
        &s3_client,
        &bucket,
        &config.region,
        "logs.yaml",
        templates::LOGS_TEMPLATE,
    )
    .await?;

    let workspace = util::workspace_directory(Some(&config.name));
    let cfn = crate::aws::cloudformation_client(aws);

    let logs_stack = config.logs_stack();
    let logs_params = [("BucketName", config.log_bucket(account))];
    util::write_artifact(
        &workspace,
        &format!("parameters-{logs_stack}.json"),
        &cloudformation::parameters_json(&logs_params),
    )?;
    let logs_outputs = cloudformation::ensure_stack(&cfn, &logs_stack, &logs_url, &logs_params).await?;
    info!(
        bucket = logs_outputs.get("LogBucketName").map(String::as_str),
        "event-log storage ready"
    );

    let network_stack = config.network_stack();
    let network_params = [
        ("VpcName", config.vpc_name()),
        ("VpcCidr", config.network.vpc_cidr.clone()),
    ];
    util::write_artifact(
        &workspace,
        &format!("parameters-{network_stack}.json"),
        &cloudformation::parameters_json(&network_params),
    )?;
    let network_outputs =
        cloudformation::ensure_stack(&cfn, &network_stack, &network_url, &network_params).await?;
    info!(
        vpc = network_outputs.get("VpcId").map(String::as_str),
        private_subnets = network_outputs.get("PrivateSubnetIds").map(String::as_str),
        "network ready"
    );
    Ok(())
}

pub async fn destroy(config: &Config, aws: &SdkConfig, account: &str) -> Result<(), Error> {
    let cfn = crate::aws::cloudformation_client(aws);
    cloudformation::delete_stack(&cfn, &config.network_stack()).await?;

    // Deliberate data-loss-avoidance policy: the log stack and both buckets
    // survive destroy and must be removed by hand.
    info!(
        stack = config.logs_stack().as_str(),
        bucket = config.log_bucket(account).as_str(),
        "retaining Spark event-log stack and bucket; delete them manually if no longer needed"
    );
    info!(
        bucket = config.templates_bucket(account).as_str(),
        "retaining templates bucket; delete it manually if no longer needed"
    );
    Ok(())
}
