//! Jobs stage: custom Spark image, demo application, and job submission

use crate::{
    aws::{eks, s3},
    config::{ClusterConfig, Config},
    error::Error,
    stage::emr,
    templates, util,
};
use aws_config::SdkConfig;
use aws_sdk_emrcontainers::types::{
    Configuration, ConfigurationOverrides, JobDriver, MonitoringConfiguration,
    S3MonitoringConfiguration, SparkSubmitJobDriver,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::info;

/// Tag pushed for the custom Spark image
const IMAGE_TAG: &str = "latest";

/// Finds or creates the ECR repository, returning its URI
async fn ensure_repository(
    client: &aws_sdk_ecr::Client,
    repository: &str,
) -> Result<String, Error> {
    match client
        .describe_repositories()
        .repository_names(repository)
        .send()
        .await
    {
        Ok(resp) => {
            let uri = resp
                .repositories()
                .first()
                .and_then(|r| r.repository_uri())
                .ok_or(Error::ResourceNotFound {
                    what: format!("URI of repository {repository}"),
                })?;
            info!(repository, "repository already exists");
            Ok(uri.to_string())
        }
        Err(e) => {
            let service_err = e.into_service_error();
            if !service_err.is_repository_not_found_exception() {
                return Err(Error::AwsEcr {
                    repository: repository.to_string(),
                    operation: "DescribeRepositories",
                    source: Box::new(aws_sdk_ecr::Error::from(service_err)),
                });
            }
            info!(repository, "creating repository");
            let resp = client
                .create_repository()
                .repository_name(repository)
                .send()
                .await
                .map_err(|e| Error::AwsEcr {
                    repository: repository.to_string(),
                    operation: "CreateRepository",
                    source: Box::new(aws_sdk_ecr::Error::from(e.into_service_error())),
                })?;
            resp.repository()
                .and_then(|r| r.repository_uri())
                .map(str::to_string)
                .ok_or(Error::ResourceNotFound {
                    what: format!("URI of created repository {repository}"),
                })
        }
    }
}

/// Logs docker into the account registry using an ECR authorization token
async fn docker_login(client: &aws_sdk_ecr::Client) -> Result<(), Error> {
    let resp = client
        .get_authorization_token()
        .send()
        .await
        .map_err(|e| Error::AwsEcr {
            repository: "*".to_string(),
            operation: "GetAuthorizationToken",
            source: Box::new(aws_sdk_ecr::Error::from(e.into_service_error())),
        })?;
    let data = resp
        .authorization_data()
        .first()
        .ok_or(Error::ResourceNotFound {
            what: "ECR authorization data".to_string(),
        })?;
    let token = data.authorization_token().ok_or(Error::ResourceNotFound {
        what: "ECR authorization token".to_string(),
    })?;
    let endpoint = data.proxy_endpoint().ok_or(Error::ResourceNotFound {
        what: "ECR proxy endpoint".to_string(),
    })?;

    // The token decodes to "AWS:<password>"
    let decoded = BASE64.decode(token).map_err(|e| Error::CommandFailed {
        command: "decode ECR token".to_string(),
        detail: e.to_string(),
    })?;
    let decoded = String::from_utf8_lossy(&decoded).into_owned();
    let password = decoded
        .split_once(':')
        .map(|(_, password)| password.to_string())
        .ok_or(Error::ResourceNotFound {
            what: "password in ECR authorization token".to_string(),
        })?;

    util::run_with_stdin(
        "docker",
        &[
            "login",
            "--username",
            "AWS",
            "--password-stdin",
            endpoint.trim_start_matches("https://"),
        ],
        password.as_bytes(),
    )
    .await?;
    info!("docker logged into ECR");
    Ok(())
}

/// Builds and pushes the custom Spark image carrying the demo application
async fn build_and_push_image(config: &Config, repository_uri: &str) -> Result<String, Error> {
    let workspace = util::workspace_directory(Some(&config.name)).join("image");
    util::write_artifact(
        &workspace,
        "spark_history_demo.py",
        templates::SPARK_HISTORY_DEMO_PY,
    )?;
    util::write_artifact(
        &workspace,
        "Dockerfile",
        &templates::render_dockerfile(&config.jobs.base_image),
    )?;

    let image = format!("{repository_uri}:{IMAGE_TAG}");
    util::run(
        "docker",
        &["build", "-t", &image, &workspace.display().to_string()],
    )
    .await?;
    util::run("docker", &["push", &image]).await?;
    info!(image = image.as_str(), "pushed Spark image");
    Ok(image)
}

/// Submits the demo job through EMR containers for one data-plane cluster
async fn submit_emr_job(
    config: &Config,
    aws: &SdkConfig,
    account: &str,
    cluster: &ClusterConfig,
    entry_point: &str,
    image: &str,
) -> Result<(), Error> {
    let emr_client = crate::aws::emr_client(aws);
    let eks_cluster = config.eks_cluster(&cluster.name);
    let vc_name = config.virtual_cluster(&cluster.name);
    let virtual_cluster_id = emr::active_virtual_clusters(&emr_client, &eks_cluster)
        .await?
        .into_iter()
        .find(|(_, name)| *name == vc_name)
        .map(|(id, _)| id)
        .ok_or(Error::ResourceNotFound {
            what: format!("virtual cluster {vc_name} (deploy the emr stage first)"),
        })?;

    let bucket = config.log_bucket(account);
    let prefix = config.log_prefix();
    let role_arn = crate::aws::iam::role_arn(account, &config.job_execution_role(&cluster.name));

    // Mirror the request to disk before submitting it
    let request = templates::render_start_job_run(
        "spark-history-demo",
        &virtual_cluster_id,
        &role_arn,
        &config.jobs.release_label,
        entry_point,
        &bucket,
        prefix,
        image,
    );
    let workspace = util::workspace_directory(Some(&config.name));
    util::write_artifact(
        &workspace,
        &format!("start-job-run-{}.json", cluster.name),
        &serde_json::to_string_pretty(&request)?,
    )?;

    let resp = emr_client
        .start_job_run()
        .virtual_cluster_id(&virtual_cluster_id)
        .name("spark-history-demo")
        .execution_role_arn(&role_arn)
        .release_label(&config.jobs.release_label)
        .job_driver(
            JobDriver::builder()
                .spark_submit_job_driver(
                    SparkSubmitJobDriver::builder()
                        .entry_point(entry_point)
                        .entry_point_arguments("--input-path")
                        .entry_point_arguments(format!("s3a://{bucket}/demo/input"))
                        .entry_point_arguments("--output-path")
                        .entry_point_arguments(format!("s3a://{bucket}/demo/output"))
                        .spark_submit_parameters(format!(
                            "--conf spark.executor.instances=2 \
                             --conf spark.executor.memory=2G \
                             --conf spark.driver.memory=2G \
                             --conf spark.kubernetes.container.image={image}"
                        ))
                        .build()?,
                )
                .build(),
        )
        .configuration_overrides(
            ConfigurationOverrides::builder()
                .application_configuration(
                    Configuration::builder()
                        .classification("spark-defaults")
                        .properties("spark.eventLog.enabled", "true")
                        .properties("spark.eventLog.dir", format!("s3a://{bucket}/{prefix}"))
                        .build()?,
                )
                .monitoring_configuration(
                    MonitoringConfiguration::builder()
                        .s3_monitoring_configuration(
                            S3MonitoringConfiguration::builder()
                                .log_uri(format!("s3://{bucket}/container-logs"))
                                .build()?,
                        )
                        .build(),
                )
                .build(),
        )
        .send()
        .await
        .map_err(|e| Error::AwsEmrContainers {
            operation: "StartJobRun",
            source: Box::new(aws_sdk_emrcontainers::Error::from(e.into_service_error())),
        })?;
    info!(
        cluster = cluster.name.as_str(),
        job_run = resp.id().unwrap_or_default(),
        "submitted EMR job run"
    );
    Ok(())
}

/// Applies the SparkApplication manifest for the operator path
async fn submit_operator_job(
    config: &Config,
    account: &str,
    cluster: &ClusterConfig,
    image: &str,
) -> Result<(), Error> {
    let eks_cluster = config.eks_cluster(&cluster.name);
    let workspace = util::workspace_directory(Some(&config.name));
    let manifest = util::write_artifact(
        &workspace,
        &format!("spark-history-demo-{}.yaml", cluster.name),
        &templates::render_spark_application(
            &cluster.namespace,
            image,
            &config.log_bucket(account),
            config.log_prefix(),
        ),
    )?;
    eks::update_kubeconfig(&config.region, &eks_cluster).await?;
    util::run(
        "kubectl",
        &[
            "apply",
            "--context",
            &eks_cluster,
            "-f",
            &manifest.display().to_string(),
        ],
    )
    .await?;
    info!(cluster = cluster.name.as_str(), "applied SparkApplication");
    Ok(())
}

pub async fn deploy(config: &Config, aws: &SdkConfig, account: &str) -> Result<(), Error> {
    let ecr_client = crate::aws::ecr_client(aws);
    let repository_uri = ensure_repository(&ecr_client, &config.jobs.repository).await?;
    docker_login(&ecr_client).await?;
    let image = build_and_push_image(config, &repository_uri).await?;

    // The demo application also goes to S3 for the EMR submission path
    let s3_client = crate::aws::s3_client(aws);
    let bucket = config.templates_bucket(account);
    s3::ensure_bucket_exists(&s3_client, &bucket, &config.region).await?;
    let script = templates::SPARK_HISTORY_DEMO_PY.as_bytes();
    let key = format!(
        "artifacts/{}/spark_history_demo.py",
        util::digest(script)
    );
    s3::upload_if_absent(&s3_client, &bucket, &key, script.to_vec()).await?;
    let entry_point = format!("s3://{bucket}/{key}");

    for cluster in &config.clusters {
        submit_emr_job(config, aws, account, cluster, &entry_point, &image).await?;
        submit_operator_job(config, account, cluster, &image).await?;
    }
    Ok(())
}

pub async fn destroy(config: &Config, aws: &SdkConfig, _account: &str) -> Result<(), Error> {
    let ecr_client = crate::aws::ecr_client(aws);
    let repository = &config.jobs.repository;
    let result = ecr_client
        .delete_repository()
        .repository_name(repository)
        .force(true)
        .send()
        .await;
    match result {
        Ok(_) => {
            info!(repository, "deleted repository");
            Ok(())
        }
        Err(e) => {
            let service_err = e.into_service_error();
            if service_err.is_repository_not_found_exception() {
                info!(repository, "repository does not exist, nothing to delete");
                Ok(())
            } else {
                Err(Error::AwsEcr {
                    repository: repository.to_string(),
                    operation: "DeleteRepository",
                    source: Box::new(aws_sdk_ecr::Error::from(service_err)),
                })
            }
        }
    }
}
