use near_api::NetworkConfig;
use near_jsonrpc_client::{JsonRpcClient, auth};
use std::error::Error;

/// Create a JSON-RPC client from network config
pub fn create_rpc_client(
    network: &NetworkConfig,
) -> Result<JsonRpcClient, Box<dyn Error + Send + Sync>> {
    let rpc_endpoint = network
        .rpc_endpoints
        .first()
        .ok_or("No RPC endpoint configured")?;

    let mut client = JsonRpcClient::connect(rpc_endpoint.url.as_str());

    if let Some(bearer) = &rpc_endpoint.bearer_header {
        let token = bearer.strip_prefix("Bearer ").unwrap_or(bearer);
        client = client.header(auth::Authorization::bearer(token)?);
    }

    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use near_api::RPCEndpoint;

    #[test]
    fn test_client_requires_an_endpoint() {
        let network = NetworkConfig {
            rpc_endpoints: vec![],
            ..NetworkConfig::mainnet()
        };
        assert!(create_rpc_client(&network).is_err());
    }

    #[test]
    fn test_client_accepts_bearer_endpoint() {
        let network = NetworkConfig {
            rpc_endpoints: vec![
                RPCEndpoint::new("https://archival-rpc.mainnet.fastnear.com/".parse().unwrap())
                    .with_api_key("test-key".to_string()),
            ],
            ..NetworkConfig::mainnet()
        };
        assert!(create_rpc_client(&network).is_ok());
    }
}
