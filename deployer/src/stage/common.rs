//! Provisioning shared by the EMR and SHS stages

use crate::{
    aws::{cloudformation, eks, iam},
    config::Config,
    error::Error,
};
use aws_config::SdkConfig;

/// Managed policies the EKS control plane and node roles need
const CLUSTER_POLICY: &str = "arn:aws:iam::aws:policy/AmazonEKSClusterPolicy";
const NODE_POLICIES: [&str; 3] = [
    "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy",
    "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly",
    "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy",
];

/// Name of the shared EKS control-plane role
pub fn cluster_role(config: &Config) -> String {
    format!("{}-eks-cluster", config.name)
}

/// Name of the shared node-group role
pub fn node_role(config: &Config) -> String {
    format!("{}-eks-node", config.name)
}

/// Ensures the control-plane and node roles exist, returning their ARNs
pub async fn ensure_cluster_roles(
    aws: &SdkConfig,
    config: &Config,
    account: &str,
) -> Result<(String, String), Error> {
    let client = crate::aws::iam_client(aws);

    let cluster_role = cluster_role(config);
    iam::ensure_role(
        &client,
        &cluster_role,
        &iam::service_trust_policy("eks.amazonaws.com"),
    )
    .await?;
    iam::attach_managed_policy(&client, &cluster_role, CLUSTER_POLICY).await?;

    let node_role = node_role(config);
    iam::ensure_role(
        &client,
        &node_role,
        &iam::service_trust_policy("ec2.amazonaws.com"),
    )
    .await?;
    for policy in NODE_POLICIES {
        iam::attach_managed_policy(&client, &node_role, policy).await?;
    }

    Ok((
        iam::role_arn(account, &cluster_role),
        iam::role_arn(account, &node_role),
    ))
}

/// Private subnet ids resolved from the network stack outputs
pub async fn private_subnets(aws: &SdkConfig, config: &Config) -> Result<Vec<String>, Error> {
    let client = crate::aws::cloudformation_client(aws);
    let stack = config.network_stack();
    let outputs = cloudformation::stack_outputs(&client, &stack).await?;
    let joined = cloudformation::require_output(&outputs, &stack, "PrivateSubnetIds")?;
    Ok(joined.split(',').map(str::to_string).collect())
}

/// Brings up one EKS cluster with a managed node group and registers its
/// OIDC issuer with IAM, returning the issuer host/path
pub async fn ensure_platform_cluster(
    aws: &SdkConfig,
    config: &Config,
    account: &str,
    cluster: &str,
    version: &str,
    instance_type: &str,
    nodes: i32,
) -> Result<String, Error> {
    let (cluster_role_arn, node_role_arn) = ensure_cluster_roles(aws, config, account).await?;
    let subnets = private_subnets(aws, config).await?;

    let eks_client = crate::aws::eks_client(aws);
    eks::ensure_cluster(&eks_client, cluster, version, &cluster_role_arn, &subnets).await?;
    eks::ensure_nodegroup(
        &eks_client,
        cluster,
        &format!("{cluster}-nodes"),
        &node_role_arn,
        &subnets,
        instance_type,
        nodes,
    )
    .await?;

    let issuer = eks::oidc_issuer(&eks_client, cluster).await?;
    let iam_client = crate::aws::iam_client(aws);
    iam::ensure_oidc_provider(&iam_client, account, &issuer).await?;
    Ok(issuer)
}

/// Tears down one EKS cluster and its OIDC provider registration; every
/// part tolerates already being gone
pub async fn delete_platform_cluster(
    aws: &SdkConfig,
    account: &str,
    cluster: &str,
) -> Result<(), Error> {
    let eks_client = crate::aws::eks_client(aws);
    let iam_client = crate::aws::iam_client(aws);

    // The issuer is only readable while the cluster exists
    let issuer = if eks::cluster_status(&eks_client, cluster).await?.is_some() {
        eks::oidc_issuer(&eks_client, cluster).await.ok()
    } else {
        None
    };

    eks::delete_nodegroup_if_exists(&eks_client, cluster, &format!("{cluster}-nodes")).await?;
    eks::delete_cluster_if_exists(&eks_client, cluster).await?;

    if let Some(issuer) = issuer {
        let arn = iam::oidc_provider_arn(account, &issuer);
        iam::delete_oidc_provider_if_exists(&iam_client, &arn).await?;
    }
    Ok(())
}
