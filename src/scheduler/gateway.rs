use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::engine::EngineId;
use crate::error::SchedulerError;
use crate::model::{DeployedCollections, ExecutionPlan, ResourceUsage};

use super::{CollectionStatus, ContainerSpec, EngineScheduler, ExposedProjects, PlanStatus};

const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
struct EngineRequest<'a> {
    project_id: i64,
    collection_id: i64,
    plan_id: i64,
    engine_index: usize,
    name: String,
    kind: &'static str,
    image: &'a str,
    cpu: &'a str,
    mem: &'a str,
}

#[derive(Debug, Deserialize)]
struct DeployedEngine {
    plan_id: i64,
    #[serde(default)]
    ready: bool,
}

#[derive(Debug, Deserialize)]
struct CollectionDeployment {
    collection_id: i64,
    launch_time: DateTime<Utc>,
    #[serde(default)]
    engines: Vec<DeployedEngine>,
}

impl CollectionDeployment {
    fn plan_counts(&self, plan_id: i64) -> (usize, usize) {
        self.engines
            .iter()
            .filter(|engine| engine.plan_id == plan_id)
            .fold((0usize, 0usize), |(deployed, ready), engine| {
                (
                    deployed.saturating_add(1),
                    ready.saturating_add(usize::from(engine.ready)),
                )
            })
    }
}

#[derive(Debug, Deserialize)]
struct ProjectIngress {
    project_id: i64,
    created_at: DateTime<Utc>,
}

fn external(context: &'static str) -> impl FnOnce(reqwest::Error) -> SchedulerError {
    move |err| SchedulerError::External {
        context,
        source: Box::new(err),
    }
}

/// Workers reachable behind one HTTP gateway as `<gateway>/<service-name>`.
///
/// The gateway owns deployments and project ingress; every query goes to it,
/// so a restarted controller sees the same cluster state.
#[derive(Debug)]
pub struct GatewayScheduler {
    base_url: String,
    http: reqwest::Client,
    reachability: reqwest::Client,
}

impl GatewayScheduler {
    /// # Errors
    ///
    /// Returns an error when an HTTP client cannot be built.
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        let reachability = reqwest::Client::builder().timeout(REACHABILITY_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            http,
            reachability,
        })
    }

    fn address_of(&self, engine: &EngineId) -> String {
        format!("{}/{}", self.base_url, engine.service_name())
    }

    async fn deployment(
        &self,
        collection_id: i64,
    ) -> Result<Option<CollectionDeployment>, SchedulerError> {
        let response = self
            .http
            .get(format!("{}/collections/{}", self.base_url, collection_id))
            .send()
            .await
            .map_err(external("collection lookup"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let deployment = response
            .error_for_status()
            .map_err(external("collection lookup"))?
            .json::<CollectionDeployment>()
            .await
            .map_err(external("collection lookup"))?;
        Ok(Some(deployment))
    }

    /// DELETE that treats an already missing resource as done.
    async fn delete(&self, url: String, context: &'static str) -> Result<(), SchedulerError> {
        let response = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(external(context))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        response.error_for_status().map_err(external(context))?;
        Ok(())
    }
}

#[async_trait]
impl EngineScheduler for GatewayScheduler {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn deploy_engine(
        &self,
        engine: &EngineId,
        spec: &ContainerSpec,
    ) -> Result<(), SchedulerError> {
        let body = EngineRequest {
            project_id: engine.project_id,
            collection_id: engine.collection_id,
            plan_id: engine.plan_id,
            engine_index: engine.engine_index,
            name: engine.engine_name(),
            kind: spec.engine_kind.name(),
            image: &spec.image,
            cpu: &spec.cpu,
            mem: &spec.mem,
        };
        let response = self
            .http
            .put(format!(
                "{}/collections/{}/engines/{}",
                self.base_url,
                engine.collection_id,
                engine.service_name()
            ))
            .json(&body)
            .send()
            .await
            .map_err(|err| SchedulerError::Deploy {
                engine: engine.engine_name(),
                message: err.to_string(),
            })?;
        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            tracing::debug!("Deployed {} ({})", engine.engine_name(), spec.image);
            return Ok(());
        }
        Err(SchedulerError::Deploy {
            engine: engine.engine_name(),
            message: format!("gateway answered {}", status),
        })
    }

    async fn expose_project(&self, project_id: i64) -> Result<(), SchedulerError> {
        let response = self
            .http
            .put(format!("{}/projects/{}/ingress", self.base_url, project_id))
            .send()
            .await
            .map_err(external("expose project"))?;
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        response
            .error_for_status()
            .map_err(external("expose project"))?;
        Ok(())
    }

    async fn purge_project_ingress(&self, project_id: i64) -> Result<(), SchedulerError> {
        self.delete(
            format!("{}/projects/{}/ingress", self.base_url, project_id),
            "purge project ingress",
        )
        .await?;
        tracing::info!("Purged ingress of project {}", project_id);
        Ok(())
    }

    async fn exposed_projects(&self) -> Result<ExposedProjects, SchedulerError> {
        let projects = self
            .http
            .get(format!("{}/projects/ingress", self.base_url))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(external("list project ingress"))?
            .json::<Vec<ProjectIngress>>()
            .await
            .map_err(external("list project ingress"))?;
        Ok(projects
            .into_iter()
            .map(|project| (project.project_id, project.created_at))
            .collect())
    }

    async fn engine_address(&self, engine: &EngineId) -> Result<String, SchedulerError> {
        Ok(self.address_of(engine))
    }

    async fn pod_ready_count(&self, collection_id: i64) -> Result<usize, SchedulerError> {
        Ok(self.deployment(collection_id).await?.map_or(0, |deployment| {
            deployment
                .engines
                .iter()
                .filter(|engine| engine.ready)
                .count()
        }))
    }

    async fn purge_collection(&self, collection_id: i64) -> Result<(), SchedulerError> {
        self.delete(
            format!("{}/collections/{}", self.base_url, collection_id),
            "purge collection",
        )
        .await?;
        tracing::info!("Purged collection {} from gateway", collection_id);
        Ok(())
    }

    async fn deployed_collections(&self) -> Result<DeployedCollections, SchedulerError> {
        let deployments = self
            .http
            .get(format!("{}/collections", self.base_url))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(external("list collections"))?
            .json::<Vec<CollectionDeployment>>()
            .await
            .map_err(external("list collections"))?;
        Ok(deployments
            .into_iter()
            .map(|deployment| (deployment.collection_id, deployment.launch_time))
            .collect())
    }

    async fn collection_status(
        &self,
        _project_id: i64,
        collection_id: i64,
        plans: &[ExecutionPlan],
    ) -> Result<CollectionStatus, SchedulerError> {
        let deployment = self.deployment(collection_id).await?;
        let plans = plans
            .iter()
            .map(|plan| {
                let (deployed, ready) = deployment
                    .as_ref()
                    .map_or((0, 0), |deployment| deployment.plan_counts(plan.plan_id));
                PlanStatus {
                    plan_id: plan.plan_id,
                    engines_reachable: plan.engines > 0 && ready == plan.engines,
                    engines: plan.engines,
                    engines_deployed: deployed,
                    in_progress: false,
                    started_time: None,
                }
            })
            .collect();
        Ok(CollectionStatus {
            plans,
            pool_size: 0,
            pool_status: String::new(),
        })
    }

    async fn download_pod_log(
        &self,
        collection_id: i64,
        plan_id: i64,
    ) -> Result<String, SchedulerError> {
        let response = self
            .http
            .get(format!(
                "{}/collections/{}/plans/{}/log",
                self.base_url, collection_id, plan_id
            ))
            .send()
            .await
            .map_err(external("download pod log"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SchedulerError::CollectionNotDeployed { collection_id });
        }
        response
            .error_for_status()
            .map_err(external("download pod log"))?
            .text()
            .await
            .map_err(external("download pod log"))
    }

    async fn pods_metrics(
        &self,
        collection_id: i64,
        plan_id: i64,
    ) -> Result<ResourceUsage, SchedulerError> {
        let response = self
            .http
            .get(format!(
                "{}/collections/{}/plans/{}/metrics",
                self.base_url, collection_id, plan_id
            ))
            .send()
            .await
            .map_err(external("pod metrics"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(BTreeMap::new());
        }
        response
            .error_for_status()
            .map_err(external("pod metrics"))?
            .json::<ResourceUsage>()
            .await
            .map_err(external("pod metrics"))
    }

    async fn service_reachable(&self, engine: &EngineId) -> bool {
        let address = self.address_of(engine);
        match self.reachability.get(format!("{}/progress", address)).send().await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!("{} is not reachable: {}", engine.service_name(), err);
                false
            }
        }
    }
}
