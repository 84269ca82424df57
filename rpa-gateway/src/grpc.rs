use rpa_proto::{
    bootstrap_service_server::{BootstrapService, BootstrapServiceServer},
    VersionRequest, VersionResponse,
};
use tonic::{Request as GrpcRequest, Response as GrpcResponse, Status as GrpcStatus};

/// Backs the convenience `Version` RPC used by operators and robot
/// installers to confirm reachability before opening the real wire-protocol
/// session; see the transport decision in DESIGN.md.
#[derive(Default, Clone)]
pub struct Bootstrap;

impl Bootstrap {
    pub fn into_server(self) -> BootstrapServiceServer<Self> {
        BootstrapServiceServer::new(self)
    }
}

#[tonic::async_trait]
impl BootstrapService for Bootstrap {
    async fn version(
        &self,
        _request: GrpcRequest<VersionRequest>,
    ) -> Result<GrpcResponse<VersionResponse>, GrpcStatus> {
        let info = rpa_core::build_info();
        Ok(GrpcResponse::new(VersionResponse {
            service: rpa_core::config().service_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_sha: info.git_sha.to_string(),
            git_tag: info.git_tag.to_string(),
            build_ts: info.build_timestamp.to_string(),
        }))
    }
}
