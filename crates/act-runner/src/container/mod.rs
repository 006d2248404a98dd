// Execution environments (container or host), the docker-backed driver, and
// the job container lifecycle.

pub mod docker_cli;
pub mod environment;
pub mod host_environment;
pub mod orchestrator;

pub use docker_cli::{DockerCli, DockerCliDriver};
pub use environment::{ContainerDriver, ContainerInput, ExecRequest, ExecutionEnvironment, FileEntry};
pub use host_environment::HostEnvironment;
