//! SHS stage: dedicated EKS cluster serving the Spark History Server
//! behind an internal ALB

use crate::{
    aws::{cloudformation, eks, iam, resolve, POLL_INTERVAL},
    config::Config,
    error::Error,
    stage::common,
    templates, util,
};
use aws_config::SdkConfig;
use std::time::Duration;
use tracing::{debug, info};

/// Namespace and Helm release of the history server; the ALB the ingress
/// provisions is named `k8s-<namespace>-...`
const SHS_NAMESPACE: &str = "shs";
const SHS_RELEASE: &str = "spark-history-server";
const ALB_PREFIX: &str = "k8s-shs";

/// Helm source of the AWS Load Balancer Controller
const ALB_RELEASE: &str = "aws-load-balancer-controller";
const EKS_CHARTS_REPO: &str = "https://aws.github.io/eks-charts";

/// How long to wait for the ingress ALB to appear or disappear
const ALB_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Writes the embedded chart into the workspace, returning the chart path
fn write_chart(config: &Config) -> Result<std::path::PathBuf, Error> {
    let chart_dir = util::workspace_directory(Some(&config.name))
        .join("chart")
        .join(SHS_RELEASE);
    util::write_artifact(&chart_dir, "Chart.yaml", templates::SHS_CHART_YAML)?;
    util::write_artifact(&chart_dir, "values.yaml", templates::SHS_DEFAULT_VALUES)?;
    let templates_dir = chart_dir.join("templates");
    util::write_artifact(
        &templates_dir,
        "deployment.yaml",
        templates::SHS_DEPLOYMENT_TEMPLATE,
    )?;
    util::write_artifact(&templates_dir, "service.yaml", templates::SHS_SERVICE_TEMPLATE)?;
    util::write_artifact(
        &templates_dir,
        "serviceaccount.yaml",
        templates::SHS_SERVICEACCOUNT_TEMPLATE,
    )?;
    util::write_artifact(&templates_dir, "ingress.yaml", templates::SHS_INGRESS_TEMPLATE)?;
    Ok(chart_dir)
}

/// Installs the AWS Load Balancer Controller with its IRSA role
async fn install_alb_controller(
    config: &Config,
    eks_cluster: &str,
    vpc_id: &str,
    role_arn: &str,
) -> Result<(), Error> {
    util::run(
        "helm",
        &["repo", "add", "eks", EKS_CHARTS_REPO, "--force-update"],
    )
    .await?;
    let annotation = format!(
        r"serviceAccount.annotations.eks\.amazonaws\.com/role-arn={role_arn}"
    );
    let args: Vec<String> = vec![
        "upgrade".into(),
        "--install".into(),
        ALB_RELEASE.into(),
        "eks/aws-load-balancer-controller".into(),
        "--namespace".into(),
        "kube-system".into(),
        "--kube-context".into(),
        eks_cluster.into(),
        "--set".into(),
        format!("clusterName={eks_cluster}"),
        "--set".into(),
        format!("region={}", config.region),
        "--set".into(),
        format!("vpcId={vpc_id}"),
        "--set".into(),
        "serviceAccount.create=true".into(),
        "--set".into(),
        format!("serviceAccount.name={ALB_RELEASE}"),
        "--set".into(),
        annotation,
        "--wait".into(),
    ];
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    util::run("helm", &arg_refs).await?;
    info!(eks_cluster, "load balancer controller installed");
    Ok(())
}

/// Polls until the ingress ALB is provisioned and active
async fn wait_alb_active(
    client: &aws_sdk_elasticloadbalancingv2::Client,
) -> Result<resolve::LoadBalancer, Error> {
    let mut interval = tokio::time::interval(POLL_INTERVAL);
    let start = std::time::Instant::now();
    loop {
        interval.tick().await;
        if start.elapsed() > ALB_TIMEOUT {
            return Err(Error::WaitTimeout {
                what: format!("load balancer {ALB_PREFIX}* to become active"),
            });
        }
        match resolve::find_load_balancer_by_prefix(client, ALB_PREFIX).await {
            Ok(lb) if lb.state == "active" => {
                info!(
                    name = lb.name.as_str(),
                    dns = lb.dns_name.as_str(),
                    "ingress load balancer active"
                );
                return Ok(lb);
            }
            Ok(lb) => {
                debug!(name = lb.name.as_str(), state = lb.state.as_str(), "ALB not ready");
            }
            Err(Error::ResourceNotFound { .. }) => {
                debug!("ingress load balancer not provisioned yet");
            }
            Err(e) => return Err(e),
        }
    }
}

pub async fn deploy(config: &Config, aws: &SdkConfig, account: &str) -> Result<(), Error> {
    let eks_cluster = config.eks_cluster(&config.shs.cluster);
    let issuer = common::ensure_platform_cluster(
        aws,
        config,
        account,
        &eks_cluster,
        &config.shs.version,
        &config.shs.instance_type,
        config.shs.nodes,
    )
    .await?;

    // IRSA roles: one for the controller, one for the history server's
    // read-only view of the event logs
    let iam_client = crate::aws::iam_client(aws);
    let alb_role = config.alb_controller_role();
    iam::ensure_role(
        &iam_client,
        &alb_role,
        &iam::irsa_trust_policy(account, &issuer, "kube-system", ALB_RELEASE),
    )
    .await?;
    iam::patch_trust_policy(
        &iam_client,
        &alb_role,
        &iam::irsa_trust_policy(account, &issuer, "kube-system", ALB_RELEASE),
    )
    .await?;
    iam::put_inline_policy(
        &iam_client,
        &alb_role,
        "alb-management",
        &iam::alb_controller_policy(),
    )
    .await?;

    let shs_role = config.shs_role();
    iam::ensure_role(
        &iam_client,
        &shs_role,
        &iam::irsa_trust_policy(account, &issuer, SHS_NAMESPACE, SHS_RELEASE),
    )
    .await?;
    iam::patch_trust_policy(
        &iam_client,
        &shs_role,
        &iam::irsa_trust_policy(account, &issuer, SHS_NAMESPACE, SHS_RELEASE),
    )
    .await?;
    iam::put_inline_policy(
        &iam_client,
        &shs_role,
        "read-event-logs",
        &iam::log_bucket_policy(&config.log_bucket(account), false),
    )
    .await?;

    let cfn = crate::aws::cloudformation_client(aws);
    let stack = config.network_stack();
    let outputs = cloudformation::stack_outputs(&cfn, &stack).await?;
    let vpc_id = cloudformation::require_output(&outputs, &stack, "VpcId")?;

    eks::update_kubeconfig(&config.region, &eks_cluster).await?;
    install_alb_controller(config, &eks_cluster, &vpc_id, &iam::role_arn(account, &alb_role))
        .await?;

    // The serving certificate comes from the ssl stage
    let acm_client = crate::aws::acm_client(aws);
    let certificate_arn = resolve::find_certificate_by_domain(&acm_client, &config.shs.domain)
        .await?
        .ok_or(Error::ResourceNotFound {
            what: format!(
                "certificate for {} (deploy the ssl stage first)",
                config.shs.domain
            ),
        })?;

    // The history server runs the same image the jobs stage pushed
    let ecr_client = crate::aws::ecr_client(aws);
    let repository_uri = match ecr_client
        .describe_repositories()
        .repository_names(&config.jobs.repository)
        .send()
        .await
    {
        Ok(resp) => resp
            .repositories()
            .first()
            .and_then(|r| r.repository_uri())
            .map(str::to_string)
            .ok_or(Error::ResourceNotFound {
                what: format!("URI of repository {}", config.jobs.repository),
            })?,
        Err(e) => {
            let service_err = e.into_service_error();
            if service_err.is_repository_not_found_exception() {
                return Err(Error::ResourceNotFound {
                    what: format!(
                        "repository {} (deploy the jobs stage first)",
                        config.jobs.repository
                    ),
                });
            }
            return Err(Error::AwsEcr {
                repository: config.jobs.repository.clone(),
                operation: "DescribeRepositories",
                source: Box::new(aws_sdk_ecr::Error::from(service_err)),
            });
        }
    };

    let chart_dir = write_chart(config)?;
    let values = templates::render_shs_values(
        &repository_uri,
        "latest",
        &config.log_bucket(account),
        config.log_prefix(),
        &iam::role_arn(account, &shs_role),
        &config.shs.domain,
        &certificate_arn,
    )?;
    let workspace = util::workspace_directory(Some(&config.name));
    let values_path = util::write_artifact(&workspace, "values-shs.yaml", &values)?;

    util::run(
        "helm",
        &[
            "upgrade",
            "--install",
            SHS_RELEASE,
            &chart_dir.display().to_string(),
            "--namespace",
            SHS_NAMESPACE,
            "--create-namespace",
            "--kube-context",
            &eks_cluster,
            "-f",
            &values_path.display().to_string(),
            "--wait",
        ],
    )
    .await?;
    info!(release = SHS_RELEASE, "history server installed");

    let elb_client = crate::aws::elb_client(aws);
    let lb = wait_alb_active(&elb_client).await?;
    info!(
        dns = lb.dns_name.as_str(),
        host = config.shs.domain.as_str(),
        "history server reachable once DNS and VPN stages are deployed"
    );
    Ok(())
}

pub async fn destroy(config: &Config, aws: &SdkConfig, account: &str) -> Result<(), Error> {
    let eks_cluster = config.eks_cluster(&config.shs.cluster);
    let eks_client = crate::aws::eks_client(aws);
    let elb_client = crate::aws::elb_client(aws);

    if eks::cluster_status(&eks_client, &eks_cluster).await?.is_some() {
        eks::update_kubeconfig(&config.region, &eks_cluster).await?;
        util::run(
            "helm",
            &[
                "uninstall",
                SHS_RELEASE,
                "--namespace",
                SHS_NAMESPACE,
                "--kube-context",
                &eks_cluster,
                "--ignore-not-found",
            ],
        )
        .await?;

        // Give the controller a chance to reap the ALB before it goes away
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        let start = std::time::Instant::now();
        loop {
            interval.tick().await;
            match resolve::find_load_balancer_by_prefix(&elb_client, ALB_PREFIX).await {
                Err(Error::ResourceNotFound { .. }) => break,
                Ok(lb) if start.elapsed() > ALB_TIMEOUT => {
                    info!(name = lb.name.as_str(), "deleting leftover load balancer");
                    elb_client
                        .delete_load_balancer()
                        .load_balancer_arn(&lb.arn)
                        .send()
                        .await
                        .map_err(|e| Error::AwsElb {
                            operation: "DeleteLoadBalancer",
                            source: Box::new(aws_sdk_elasticloadbalancingv2::Error::from(
                                e.into_service_error(),
                            )),
                        })?;
                    break;
                }
                Ok(lb) => {
                    debug!(name = lb.name.as_str(), "waiting for controller to reap ALB");
                }
                Err(e) => return Err(e),
            }
        }

        util::run(
            "helm",
            &[
                "uninstall",
                ALB_RELEASE,
                "--namespace",
                "kube-system",
                "--kube-context",
                &eks_cluster,
                "--ignore-not-found",
            ],
        )
        .await?;
    } else {
        // No cluster means no controller; reap any leftover ALB directly
        match resolve::find_load_balancer_by_prefix(&elb_client, ALB_PREFIX).await {
            Ok(lb) => {
                info!(name = lb.name.as_str(), "deleting leftover load balancer");
                elb_client
                    .delete_load_balancer()
                    .load_balancer_arn(&lb.arn)
                    .send()
                    .await
                    .map_err(|e| Error::AwsElb {
                        operation: "DeleteLoadBalancer",
                        source: Box::new(aws_sdk_elasticloadbalancingv2::Error::from(
                            e.into_service_error(),
                        )),
                    })?;
            }
            Err(Error::ResourceNotFound { .. }) => {
                info!("no leftover load balancer");
            }
            Err(e) => return Err(e),
        }
    }

    common::delete_platform_cluster(aws, account, &eks_cluster).await?;

    let iam_client = crate::aws::iam_client(aws);
    iam::delete_role_if_exists(&iam_client, &config.shs_role()).await?;
    iam::delete_role_if_exists(&iam_client, &config.alb_controller_role()).await?;
    Ok(())
}
