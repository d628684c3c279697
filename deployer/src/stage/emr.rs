//! EMR stage: data-plane EKS clusters, IRSA, Spark Operator, and EMR
//! virtual clusters

use crate::{
    aws::{eks, iam, POLL_INTERVAL},
    config::{ClusterConfig, Config},
    error::Error,
    stage::common,
    templates, util,
};
use aws_config::SdkConfig;
use aws_sdk_emrcontainers::types::{
    ContainerInfo, ContainerProvider, ContainerProviderType, EksInfo, VirtualClusterState,
};
use std::time::Duration;
use tracing::{debug, info};

/// Helm release name and chart source of the Spark Operator
const SPARK_OPERATOR_RELEASE: &str = "spark-operator";
const SPARK_OPERATOR_REPO: &str = "https://kubeflow.github.io/spark-operator";

/// Service-linked role EMR uses to reach the cluster
const EMR_SERVICE_LINKED_ROLE: &str = "AWSServiceRoleForAmazonEMRContainers";

/// How long to wait for a virtual cluster to terminate
const VIRTUAL_CLUSTER_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Ids of virtual clusters attached to an EKS cluster that are not
/// terminated
pub async fn active_virtual_clusters(
    client: &aws_sdk_emrcontainers::Client,
    eks_cluster: &str,
) -> Result<Vec<(String, String)>, Error> {
    let mut results = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let mut request = client
            .list_virtual_clusters()
            .container_provider_id(eks_cluster)
            .container_provider_type(ContainerProviderType::Eks)
            .states(VirtualClusterState::Running)
            .states(VirtualClusterState::Arrested);
        if let Some(t) = token.take() {
            request = request.next_token(t);
        }
        let resp = request.send().await.map_err(|e| Error::AwsEmrContainers {
            operation: "ListVirtualClusters",
            source: Box::new(aws_sdk_emrcontainers::Error::from(e.into_service_error())),
        })?;
        for vc in resp.virtual_clusters() {
            if let (Some(id), Some(name)) = (vc.id(), vc.name()) {
                results.push((id.to_string(), name.to_string()));
            }
        }
        match resp.next_token() {
            Some(next) => token = Some(next.to_string()),
            None => break,
        }
    }
    Ok(results)
}

/// Creates the virtual cluster mapping a namespace onto EMR unless it
/// already exists, returning its id
async fn ensure_virtual_cluster(
    client: &aws_sdk_emrcontainers::Client,
    eks_cluster: &str,
    name: &str,
    namespace: &str,
) -> Result<String, Error> {
    for (id, existing) in active_virtual_clusters(client, eks_cluster).await? {
        if existing == name {
            info!(name, id = id.as_str(), "virtual cluster already exists");
            return Ok(id);
        }
    }

    info!(name, eks_cluster, namespace, "creating virtual cluster");
    let resp = client
        .create_virtual_cluster()
        .name(name)
        .container_provider(
            ContainerProvider::builder()
                .id(eks_cluster)
                .r#type(ContainerProviderType::Eks)
                .info(ContainerInfo::EksInfo(
                    EksInfo::builder().namespace(namespace).build(),
                ))
                .build()?,
        )
        .send()
        .await
        .map_err(|e| Error::AwsEmrContainers {
            operation: "CreateVirtualCluster",
            source: Box::new(aws_sdk_emrcontainers::Error::from(e.into_service_error())),
        })?;
    resp.id()
        .map(str::to_string)
        .ok_or(Error::ResourceNotFound {
            what: format!("created virtual cluster id for {name}"),
        })
}

/// Deletes a virtual cluster and waits until it is terminated
async fn delete_virtual_cluster(
    client: &aws_sdk_emrcontainers::Client,
    id: &str,
) -> Result<(), Error> {
    client
        .delete_virtual_cluster()
        .id(id)
        .send()
        .await
        .map_err(|e| Error::AwsEmrContainers {
            operation: "DeleteVirtualCluster",
            source: Box::new(aws_sdk_emrcontainers::Error::from(e.into_service_error())),
        })?;

    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = std::time::Instant::now();
    loop {
        interval.tick().await;
        if start.elapsed() > VIRTUAL_CLUSTER_TIMEOUT {
            return Err(Error::WaitTimeout {
                what: format!("virtual cluster {id} to terminate"),
            });
        }
        let resp = client
            .describe_virtual_cluster()
            .id(id)
            .send()
            .await
            .map_err(|e| Error::AwsEmrContainers {
                operation: "DescribeVirtualCluster",
                source: Box::new(aws_sdk_emrcontainers::Error::from(e.into_service_error())),
            })?;
        let state = resp
            .virtual_cluster()
            .and_then(|vc| vc.state())
            .map(|s| s.as_str().to_string())
            .unwrap_or_default();
        if state == "TERMINATED" {
            info!(id, "virtual cluster terminated");
            return Ok(());
        }
        debug!(id, state = state.as_str(), "virtual cluster terminating");
    }
}

/// Installs the Spark Operator into a cluster via Helm
async fn install_spark_operator(eks_cluster: &str) -> Result<(), Error> {
    util::run(
        "helm",
        &[
            "repo",
            "add",
            SPARK_OPERATOR_RELEASE,
            SPARK_OPERATOR_REPO,
            "--force-update",
        ],
    )
    .await?;
    util::run(
        "helm",
        &[
            "upgrade",
            "--install",
            SPARK_OPERATOR_RELEASE,
            "spark-operator/spark-operator",
            "--namespace",
            "spark-operator",
            "--create-namespace",
            "--kube-context",
            eks_cluster,
            "--wait",
        ],
    )
    .await?;
    info!(eks_cluster, "spark operator installed");
    Ok(())
}

/// Brings one data-plane cluster to its target state
async fn deploy_cluster(
    config: &Config,
    aws: &SdkConfig,
    account: &str,
    cluster: &ClusterConfig,
) -> Result<(), Error> {
    let eks_cluster = config.eks_cluster(&cluster.name);
    let issuer = common::ensure_platform_cluster(
        aws,
        config,
        account,
        &eks_cluster,
        &cluster.version,
        &cluster.instance_type,
        cluster.nodes,
    )
    .await?;

    // Job execution role: created with the base service trust, then the
    // trust policy is patched with the OIDC federation statement
    let iam_client = crate::aws::iam_client(aws);
    let role = config.job_execution_role(&cluster.name);
    iam::ensure_role(
        &iam_client,
        &role,
        &iam::service_trust_policy("emr-containers.amazonaws.com"),
    )
    .await?;
    iam::patch_trust_policy(
        &iam_client,
        &role,
        &iam::emr_job_trust_policy(account, &issuer, &cluster.namespace),
    )
    .await?;
    iam::put_inline_policy(
        &iam_client,
        &role,
        "spark-event-logs",
        &iam::log_bucket_policy(&config.log_bucket(account), true),
    )
    .await?;

    // Namespace RBAC for the EMR control plane, plus the access entry
    // mapping its service-linked role onto the emr-containers user
    eks::update_kubeconfig(&config.region, &eks_cluster).await?;
    let workspace = util::workspace_directory(Some(&config.name));
    let rbac = util::write_artifact(
        &workspace,
        &format!("emr-rbac-{}.yaml", cluster.name),
        &templates::render_emr_rbac(&cluster.namespace),
    )?;
    util::run(
        "kubectl",
        &[
            "apply",
            "--context",
            &eks_cluster,
            "-f",
            &rbac.display().to_string(),
        ],
    )
    .await?;
    let eks_client = crate::aws::eks_client(aws);
    eks::ensure_access_entry(
        &eks_client,
        &eks_cluster,
        &format!(
            "arn:aws:iam::{account}:role/aws-service-role/emr-containers.amazonaws.com/{EMR_SERVICE_LINKED_ROLE}"
        ),
        "emr-containers",
    )
    .await?;

    install_spark_operator(&eks_cluster).await?;

    let emr_client = crate::aws::emr_client(aws);
    ensure_virtual_cluster(
        &emr_client,
        &eks_cluster,
        &config.virtual_cluster(&cluster.name),
        &cluster.namespace,
    )
    .await?;
    Ok(())
}

pub async fn deploy(config: &Config, aws: &SdkConfig, account: &str) -> Result<(), Error> {
    for cluster in &config.clusters {
        info!(cluster = cluster.name.as_str(), "deploying data-plane cluster");
        deploy_cluster(config, aws, account, cluster).await?;
    }
    Ok(())
}

pub async fn destroy(config: &Config, aws: &SdkConfig, account: &str) -> Result<(), Error> {
    let emr_client = crate::aws::emr_client(aws);
    let eks_client = crate::aws::eks_client(aws);
    let iam_client = crate::aws::iam_client(aws);

    for cluster in &config.clusters {
        let eks_cluster = config.eks_cluster(&cluster.name);

        for (id, name) in active_virtual_clusters(&emr_client, &eks_cluster).await? {
            info!(id = id.as_str(), name = name.as_str(), "deleting virtual cluster");
            delete_virtual_cluster(&emr_client, &id).await?;
        }

        // The operator release only needs uninstalling while the cluster is
        // still around; cluster deletion takes it along otherwise
        if eks::cluster_status(&eks_client, &eks_cluster).await?.is_some() {
            eks::update_kubeconfig(&config.region, &eks_cluster).await?;
            util::run(
                "helm",
                &[
                    "uninstall",
                    SPARK_OPERATOR_RELEASE,
                    "--namespace",
                    "spark-operator",
                    "--kube-context",
                    &eks_cluster,
                    "--ignore-not-found",
                ],
            )
            .await?;
        }

        common::delete_platform_cluster(aws, account, &eks_cluster).await?;
        iam::delete_role_if_exists(&iam_client, &config.job_execution_role(&cluster.name)).await?;
    }
    Ok(())
}
