use clap::{Args as ClapArgs, Parser, Subcommand};
use kubicctl::proto::{
    certificate_client::CertificateClient, deploy_client::DeployClient, kubeadm_client::KubeadmClient,
    AddNodeRequest, CreateCertRequest, DeployHelmRequest, DeployKustomizeRequest, Empty, InitRequest,
    RebootNodeRequest, RemoveNodeRequest, StatusReply, UpgradeRequest,
};
use kubic_control::grpc::AccessPolicy;
use kubicctl::admin::{add_account, initialize_certificates, list_roles};
use kubicctl::{ClientError, Connection, Reporter, DEFAULT_PORT};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tonic::transport::Channel;
use tonic::Request;

#[derive(Parser, Debug)]
#[command(name = "kubicctl", version)]
#[command(about = "Kubic Control Daemon Interface", long_about = None)]
struct Cli {
    /// Name of server kubicd is running on
    #[arg(short, long, global = true, default_value = "localhost")]
    server: String,

    /// Port on which kubicd is listening
    #[arg(short, long, global = true, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Certificate with the public key for the user
    #[arg(long, global = true, default_value = "~/.config/kubicctl/pki/user.crt")]
    crtfile: PathBuf,

    /// Private key for the user
    #[arg(long, global = true, default_value = "~/.config/kubicctl/pki/user.key")]
    keyfile: PathBuf,

    /// Certificate of the CA that signed the server certificate
    #[arg(long, global = true, default_value = "~/.config/kubicctl/pki/Kubic-Control.crt")]
    cafile: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage certificates for kubicd/kubicctl communication
    #[command(subcommand)]
    Certificates(CertificatesCommand),
    /// Manage the access policy of kubicd
    #[command(subcommand)]
    Rbac(RbacCommand),
    #[command(flatten)]
    Remote(RemoteCommand),
}

/// Commands answered by kubicd.
#[derive(Subcommand, Debug)]
enum RemoteCommand {
    /// Initialize Kubernetes master node
    Init(InitArgs),
    /// Manage cluster nodes
    #[command(subcommand)]
    Node(NodeCommand),
    /// Upgrade the cluster to a new Kubernetes version
    Upgrade {
        #[arg(long, default_value = "")]
        kubernetes_version: String,
    },
    /// Show versions and the state of deployed add-ons
    Status,
    /// Remove the control plane from this machine
    DestroyCluster,
    /// Deploy add-ons
    #[command(subcommand)]
    Deploy(DeployCommand),
    /// Fetch the admin kubeconfig
    FetchKubeconfig {
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(ClapArgs, Debug)]
struct InitArgs {
    /// Pod network: cilium, flannel or weave
    #[arg(long, default_value = "weave")]
    pod_network: String,
    /// IP address the API server advertises
    #[arg(long, default_value = "")]
    adv_addr: String,
    /// DNS name of the load balancer of a multi-master cluster
    #[arg(long, default_value = "")]
    multi_master: String,
    /// Fleet id of the haproxy node in front of the masters
    #[arg(long, default_value = "")]
    load_balancer: String,
    #[arg(long, default_value = "")]
    kubernetes_version: String,
    /// official or devel
    #[arg(long, default_value = "")]
    stage: String,
    /// Extra SANs for the API server certificate, comma separated
    #[arg(long, default_value = "")]
    apiserver_cert_extra_sans: String,
    /// Fleet id of this machine
    #[arg(long, default_value = "")]
    first_master: String,
}

#[derive(Subcommand, Debug)]
enum NodeCommand {
    /// Add nodes to the cluster
    Add {
        node: String,
        /// worker or master
        #[arg(long = "type", default_value = "worker")]
        node_type: String,
    },
    /// Remove nodes from the cluster
    Remove { node: String },
    /// List cluster nodes
    List,
    /// Drain and reboot nodes
    Reboot { node: String },
}

#[derive(Subcommand, Debug)]
enum CertificatesCommand {
    /// Create a certificate for a user; writes <user>.key and <user>.crt
    Create { user: String },
    /// Create the CA, KubicD and admin certificates on this machine
    Initialize {
        /// PKI directory to find and store certificates
        #[arg(long, default_value = "/etc/kubicd/pki")]
        pki_dir: PathBuf,
    },
}

#[derive(ClapArgs, Debug)]
struct PolicyFiles {
    /// Access policy shipped with kubicd
    #[arg(long, default_value = "/usr/share/defaults/kubicd/rbac.conf")]
    default_file: PathBuf,
    /// Local additions; the only file written
    #[arg(long, default_value = "/etc/kubicd/rbac.conf")]
    override_file: PathBuf,
}

impl PolicyFiles {
    fn policy(&self) -> AccessPolicy {
        AccessPolicy::new(&self.default_file, &self.override_file)
    }
}

#[derive(Subcommand, Debug)]
enum RbacCommand {
    /// List roles and accounts
    List(PolicyFiles),
    /// Add user account to a role
    Add {
        role: String,
        user: String,
        #[command(flatten)]
        files: PolicyFiles,
    },
}

#[derive(Subcommand, Debug)]
enum DeployCommand {
    /// Deploy MetalLB with a layer 2 address range
    Metallb { range: String },
    /// Deploy the hello-kubic demo service
    HelloKubic {
        /// NodePort or LoadBalancer
        #[arg(short = 't', long = "type", default_value = "")]
        service_type: String,
        /// Preferred load balancer IP
        #[arg(short, long, default_value = "")]
        ip: String,
    },
    /// Install a Helm chart
    Helm {
        chart: String,
        #[arg(long)]
        release: String,
        #[arg(long, default_value = "")]
        values: String,
        #[arg(long, default_value = "")]
        namespace: String,
    },
}

fn with_timeout<T>(message: T, minutes: u64) -> Request<T> {
    let mut request = Request::new(message);
    request.set_timeout(Duration::from_secs(minutes * 60));
    request
}

fn write_private(path: &Path, contents: &str) -> io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())
}

/// Print a unary reply; returns whether it succeeded.
fn single(reply: StatusReply) -> io::Result<bool> {
    let mut reporter = Reporter::new(io::stdout(), io::stderr());
    reporter.report(&reply)?;
    Ok(reporter.succeeded())
}

async fn run(command: RemoteCommand, channel: Channel) -> Result<bool, ClientError> {
    let mut reporter = Reporter::new(io::stdout(), io::stderr());
    let mut kubeadm = KubeadmClient::new(channel.clone());

    match command {
        RemoteCommand::Init(args) => {
            println!("Initializing kubernetes master can take several minutes, please be patient.");
            let req = InitRequest {
                pod_networking: args.pod_network,
                adv_addr: args.adv_addr,
                multi_master: args.multi_master,
                kubernetes_version: args.kubernetes_version,
                stage: args.stage,
                load_balancer_node: args.load_balancer,
                apiserver_cert_extra_sans: args.apiserver_cert_extra_sans,
                first_master_node: args.first_master,
            };
            let stream = kubeadm.init_master(with_timeout(req, 10)).await?.into_inner();
            reporter.follow(stream).await?;
        }
        RemoteCommand::Node(NodeCommand::Add { node, node_type }) => {
            let req = AddNodeRequest { node_names: node, r#type: node_type };
            let stream = kubeadm.add_node(with_timeout(req, 10)).await?.into_inner();
            reporter.follow(stream).await?;
        }
        RemoteCommand::Node(NodeCommand::Remove { node }) => {
            let req = RemoveNodeRequest { node_names: node };
            let stream = kubeadm.remove_node(with_timeout(req, 10)).await?.into_inner();
            reporter.follow(stream).await?;
        }
        RemoteCommand::Node(NodeCommand::List) => {
            let reply = kubeadm.list_nodes(with_timeout(Empty {}, 1)).await?.into_inner();
            if !reply.success {
                eprintln!("{}", reply.message.trim_end());
                return Ok(false);
            }
            for node in reply.node {
                println!("{}", node);
            }
        }
        RemoteCommand::Node(NodeCommand::Reboot { node }) => {
            let req = RebootNodeRequest { node_names: node };
            let reply = kubeadm.reboot_node(with_timeout(req, 2)).await?.into_inner();
            return Ok(single(reply)?);
        }
        RemoteCommand::Upgrade { kubernetes_version } => {
            let req = UpgradeRequest { kubernetes_version };
            let stream = kubeadm.upgrade_kubernetes(with_timeout(req, 20)).await?.into_inner();
            reporter.follow(stream).await?;
        }
        RemoteCommand::Status => {
            let stream = kubeadm.get_status(with_timeout(Empty {}, 10)).await?.into_inner();
            reporter.follow(stream).await?;
        }
        RemoteCommand::DestroyCluster => {
            let stream = kubeadm.destroy_master(with_timeout(Empty {}, 10)).await?.into_inner();
            reporter.follow(stream).await?;
        }
        RemoteCommand::Deploy(deploy) => {
            let mut client = DeployClient::new(channel);
            let reply = match deploy {
                DeployCommand::Metallb { range } => {
                    let req = DeployKustomizeRequest { service: "metallb".into(), argument: range };
                    client.deploy_kustomize(with_timeout(req, 5)).await?
                }
                DeployCommand::HelloKubic { service_type, ip } => {
                    let argument = if ip.is_empty() { service_type } else { ip };
                    let req = DeployKustomizeRequest { service: "hello-kubic".into(), argument };
                    client.deploy_kustomize(with_timeout(req, 5)).await?
                }
                DeployCommand::Helm { chart, release, values, namespace } => {
                    let req = DeployHelmRequest {
                        chart_name: chart,
                        release_name: release,
                        values_path: values,
                        namespace,
                    };
                    client.deploy_helm(with_timeout(req, 5)).await?
                }
            };
            return Ok(single(reply.into_inner())?);
        }
        RemoteCommand::FetchKubeconfig { output } => {
            let reply = kubeadm.fetch_kubeconfig(with_timeout(Empty {}, 1)).await?.into_inner();
            match output {
                Some(path) if reply.success => write_private(&path, &reply.message)?,
                _ if reply.success => print!("{}", reply.message),
                _ => {
                    eprintln!("{}", reply.message.trim_end());
                    return Ok(false);
                }
            }
        }
    }
    Ok(reporter.succeeded())
}

async fn create_certificate(channel: Channel, user: String) -> Result<bool, ClientError> {
    let mut client = CertificateClient::new(channel);
    let req = CreateCertRequest { name: user.clone() };
    let reply = client.create_cert(with_timeout(req, 2)).await?.into_inner();
    if !reply.success {
        eprintln!("Creating certificate for {} failed: {}", user, reply.message.trim_end());
        return Ok(false);
    }
    write_private(Path::new(&format!("{}.key", user)), &reply.key)?;
    write_private(Path::new(&format!("{}.crt", user)), &reply.crt)?;
    println!("{}", reply.message);
    Ok(true)
}

/// Rbac and certificate bootstrap work on local files; everything else
/// needs a connection to kubicd.
async fn dispatch(command: Command, connection: Connection) -> Result<bool, ClientError> {
    let mut out = io::stdout();
    match command {
        Command::Rbac(RbacCommand::List(files)) => list_roles(&files.policy(), &mut out)?,
        Command::Rbac(RbacCommand::Add { role, user, files }) => add_account(&files.policy(), &role, &user, &mut out)?,
        Command::Certificates(CertificatesCommand::Initialize { pki_dir }) => {
            initialize_certificates(&pki_dir).await?;
            println!(
                "All certificates and the CA are created and can be found in '{}'",
                pki_dir.display()
            );
        }
        Command::Certificates(CertificatesCommand::Create { user }) => {
            return create_certificate(connection.connect().await?, user).await;
        }
        Command::Remote(remote) => return run(remote, connection.connect().await?).await,
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let connection = Connection {
        server: cli.server,
        port: cli.port,
        crt_file: cli.crtfile,
        key_file: cli.keyfile,
        ca_file: cli.cafile,
    };

    match dispatch(cli.command, connection).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
