use super::certs::CertificateIssuer;
use super::gateway::{CallAudit, CallOutcome, Gateway};
use super::policy::AccessPolicy;
use super::proto::{
    certificate_server::{Certificate, CertificateServer},
    deploy_server::{Deploy, DeployServer},
    kubeadm_server::{Kubeadm, KubeadmServer},
    AddNodeRequest, CertificateReply, CreateCertRequest, DeployHelmRequest, DeployKustomizeRequest, Empty,
    InitRequest, ListReply, RebootNodeRequest, RemoveNodeRequest, StatusReply, UpgradeRequest,
};
use crate::config::DaemonConfig;
use crate::orchestrator::{self, HelmRelease, Orchestrator, ProgressSink, WorkflowResult};
use slog::{error, info, o, Logger};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_stream::{Stream, StreamExt};
use tonic::transport::{Certificate as TlsCertificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

/// Buffered progress messages per streaming call.
const STREAM_CAPACITY: usize = 32;

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<StatusReply, Status>> + Send>>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("error reading \"{}\": {err}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        err: io::Error,
    },
    #[error("cannot resolve listen address {0}")]
    Address(String),
    #[error("cannot bind {addr}: {err}")]
    Bind {
        addr: String,
        #[source]
        err: io::Error,
    },
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
}

fn status_reply(result: Result<String, String>) -> StatusReply {
    match result {
        Ok(message) => StatusReply { success: true, message },
        Err(message) => StatusReply { success: false, message },
    }
}

fn outcome_of<T>(result: &Result<T, String>) -> CallOutcome {
    if result.is_ok() {
        CallOutcome::Succeeded
    } else {
        CallOutcome::Failed
    }
}

/// State shared by the three services.
#[derive(Clone)]
struct Services {
    orchestrator: Orchestrator,
    gateway: Gateway,
    issuer: CertificateIssuer,
    log: Logger,
}

impl Services {
    /// Run a workflow in its own task and hand back its progress stream.
    /// The call is audited when the workflow ends.
    fn stream_workflow<F, Fut>(&self, audit: CallAudit, workflow: F) -> Response<ResponseStream>
    where
        F: FnOnce(Orchestrator, ProgressSink) -> Fut + Send + 'static,
        Fut: Future<Output = WorkflowResult> + Send + 'static,
    {
        let (sink, rx) = ProgressSink::channel(STREAM_CAPACITY, self.log.new(o!("caller" => audit.caller().to_string())));
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let result = workflow(orchestrator, sink).await;
            let detail = match &result {
                Ok(_) => String::new(),
                Err(err) => err.to_string(),
            };
            audit.finish(CallOutcome::from(&result), &detail);
        });

        let stream = ReceiverStream::new(rx).map(|msg| {
            Ok(StatusReply { success: msg.success, message: msg.message })
        });
        Response::new(Box::pin(stream) as ResponseStream)
    }
}

pub struct KubeadmService(Services);
pub struct CertificateService(Services);
pub struct DeployService(Services);

#[tonic::async_trait]
impl Kubeadm for KubeadmService {
    type InitMasterStream = ResponseStream;
    type AddNodeStream = ResponseStream;
    type RemoveNodeStream = ResponseStream;
    type DestroyMasterStream = ResponseStream;
    type UpgradeKubernetesStream = ResponseStream;
    type GetStatusStream = ResponseStream;

    async fn init_master(&self, request: Request<InitRequest>) -> Result<Response<Self::InitMasterStream>, Status> {
        let audit = self.0.gateway.admit("/api.Kubeadm/InitMaster", &request)?;
        let req = request.into_inner();
        let req = orchestrator::InitRequest {
            pod_networking: req.pod_networking,
            adv_addr: req.adv_addr,
            multi_master: req.multi_master,
            kubernetes_version: req.kubernetes_version,
            stage: req.stage,
            load_balancer_node: req.load_balancer_node,
            apiserver_cert_extra_sans: req.apiserver_cert_extra_sans,
            first_master_node: req.first_master_node,
        };
        Ok(self.0.stream_workflow(audit, move |o, sink| async move { o.init_master(req, sink).await }))
    }

    async fn add_node(&self, request: Request<AddNodeRequest>) -> Result<Response<Self::AddNodeStream>, Status> {
        let audit = self.0.gateway.admit("/api.Kubeadm/AddNode", &request)?;
        let req = request.into_inner();
        let req = orchestrator::AddNodeRequest { node_names: req.node_names, role: req.r#type };
        Ok(self.0.stream_workflow(audit, move |o, sink| async move { o.add_node(req, sink).await }))
    }

    async fn remove_node(&self, request: Request<RemoveNodeRequest>) -> Result<Response<Self::RemoveNodeStream>, Status> {
        let audit = self.0.gateway.admit("/api.Kubeadm/RemoveNode", &request)?;
        let nodes = request.into_inner().node_names;
        Ok(self.0.stream_workflow(audit, move |o, sink| async move { o.remove_node(&nodes, sink).await }))
    }

    async fn destroy_master(&self, request: Request<Empty>) -> Result<Response<Self::DestroyMasterStream>, Status> {
        let audit = self.0.gateway.admit("/api.Kubeadm/DestroyMaster", &request)?;
        Ok(self.0.stream_workflow(audit, |o, sink| async move { o.destroy_master(sink).await }))
    }

    async fn upgrade_kubernetes(
        &self,
        request: Request<UpgradeRequest>,
    ) -> Result<Response<Self::UpgradeKubernetesStream>, Status> {
        let audit = self.0.gateway.admit("/api.Kubeadm/UpgradeKubernetes", &request)?;
        let version = request.into_inner().kubernetes_version;
        Ok(self.0.stream_workflow(audit, move |o, sink| async move { o.upgrade_kubernetes(&version, sink).await }))
    }

    async fn get_status(&self, request: Request<Empty>) -> Result<Response<Self::GetStatusStream>, Status> {
        let audit = self.0.gateway.admit("/api.Kubeadm/GetStatus", &request)?;
        Ok(self.0.stream_workflow(audit, |o, sink| async move { o.status(sink).await }))
    }

    async fn list_nodes(&self, request: Request<Empty>) -> Result<Response<ListReply>, Status> {
        let audit = self.0.gateway.admit("/api.Kubeadm/ListNodes", &request)?;
        let reply = match self.0.orchestrator.list_nodes().await {
            Ok(node) => {
                audit.finish(CallOutcome::Succeeded, "");
                ListReply { success: true, message: String::new(), node }
            }
            Err(out) => {
                audit.finish(CallOutcome::Failed, &out.output);
                ListReply { success: false, message: out.output, node: Vec::new() }
            }
        };
        Ok(Response::new(reply))
    }

    async fn reboot_node(&self, request: Request<RebootNodeRequest>) -> Result<Response<StatusReply>, Status> {
        let audit = self.0.gateway.admit("/api.Kubeadm/RebootNode", &request)?;
        let result = self.0.orchestrator.reboot_nodes(&request.into_inner().node_names).await;
        audit.finish(outcome_of(&result), result.as_ref().err().map_or("", String::as_str));
        Ok(Response::new(status_reply(result)))
    }

    async fn fetch_kubeconfig(&self, request: Request<Empty>) -> Result<Response<StatusReply>, Status> {
        let audit = self.0.gateway.admit("/api.Kubeadm/FetchKubeconfig", &request)?;
        let result = self.0.orchestrator.fetch_kubeconfig().await;
        audit.finish(outcome_of(&result), result.as_ref().err().map_or("", String::as_str));
        Ok(Response::new(status_reply(result)))
    }
}

#[tonic::async_trait]
impl Certificate for CertificateService {
    async fn create_cert(&self, request: Request<CreateCertRequest>) -> Result<Response<CertificateReply>, Status> {
        let audit = self.0.gateway.admit("/api.Certificate/CreateCert", &request)?;
        let name = request.into_inner().name;
        let reply = match self.0.issuer.create(&name).await {
            Ok(issued) => {
                audit.finish(CallOutcome::Succeeded, "");
                CertificateReply {
                    success: true,
                    message: format!("Certificate for {} created", name.trim()),
                    key: issued.key,
                    crt: issued.crt,
                }
            }
            Err(message) => {
                audit.finish(CallOutcome::Failed, &message);
                CertificateReply { success: false, message, key: String::new(), crt: String::new() }
            }
        };
        Ok(Response::new(reply))
    }
}

#[tonic::async_trait]
impl Deploy for DeployService {
    async fn deploy_kustomize(&self, request: Request<DeployKustomizeRequest>) -> Result<Response<StatusReply>, Status> {
        let audit = self.0.gateway.admit("/api.Deploy/DeployKustomize", &request)?;
        let req = request.into_inner();
        let result = self.0.orchestrator.deploy_kustomize(&req.service, &req.argument).await;
        audit.finish(outcome_of(&result), result.as_ref().err().map_or("", String::as_str));
        Ok(Response::new(status_reply(result)))
    }

    async fn deploy_helm(&self, request: Request<DeployHelmRequest>) -> Result<Response<StatusReply>, Status> {
        let audit = self.0.gateway.admit("/api.Deploy/DeployHelm", &request)?;
        let req = request.into_inner();
        let release = HelmRelease {
            chart: req.chart_name,
            release: req.release_name,
            values_path: req.values_path,
            namespace: req.namespace,
        };
        let result = self.0.orchestrator.deploy_helm(release).await;
        audit.finish(outcome_of(&result), result.as_ref().err().map_or("", String::as_str));
        Ok(Response::new(status_reply(result)))
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ServerError> {
    std::fs::read(path).map_err(|err| ServerError::Read { path: path.into(), err })
}

/// Server identity plus the CA every client certificate must chain to.
pub fn tls_config(config: &DaemonConfig) -> Result<ServerTlsConfig, ServerError> {
    let identity = Identity::from_pem(read_pem(&config.crt_file)?, read_pem(&config.key_file)?);
    let client_ca = TlsCertificate::from_pem(read_pem(&config.ca_file)?);
    Ok(ServerTlsConfig::new().identity(identity).client_ca_root(client_ca))
}

/// gRPC server handle with graceful shutdown support
pub struct GrpcServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl GrpcServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting calls and wait for the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.task.await;
    }
}

/// Bind the listener and serve the three services until shutdown.
pub async fn start_server(
    config: &DaemonConfig,
    orchestrator: Orchestrator,
    tls: ServerTlsConfig,
    log: Logger,
) -> Result<GrpcServerHandle, ServerError> {
    let address = config.listen_address();
    let addr = tokio::net::lookup_host(&address)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ServerError::Address(address.clone()))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| ServerError::Bind { addr: address.clone(), err })?;
    let local_addr = listener.local_addr().map_err(|err| ServerError::Bind { addr: address, err })?;

    let log = log.new(o!("component" => "grpc"));
    let services = Services {
        gateway: Gateway::new(
            AccessPolicy::new(&config.rbac_default, &config.rbac_override),
            log.new(o!("component" => "audit")),
        ),
        issuer: CertificateIssuer::new(orchestrator.exec().clone(), &config.pki_dir, log.clone()),
        orchestrator,
        log: log.clone(),
    };

    let mut server = Server::builder().tls_config(tls)?;
    let router = server
        .add_service(KubeadmServer::new(KubeadmService(services.clone())))
        .add_service(CertificateServer::new(CertificateService(services.clone())))
        .add_service(DeployServer::new(DeployService(services)));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    info!(log, "kubicd listening"; "address" => %local_addr);
    let task = tokio::spawn(async move {
        let incoming = TcpListenerStream::new(listener);
        if let Err(err) = router
            .serve_with_incoming_shutdown(incoming, async {
                shutdown_rx.await.ok();
            })
            .await
        {
            error!(log, "gRPC server failed"; "error" => %err);
        }
    });

    Ok(GrpcServerHandle { local_addr, shutdown_tx, task })
}
