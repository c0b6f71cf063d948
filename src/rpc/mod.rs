mod metadata;
mod rpc;

pub use metadata::{HttpMetadataResolver, MetadataClientConfig};

pub use rpc::{
    encode_calldata, parse_function_signature, with_retry, RateLimitConfig, Retryable,
    RetryConfig, RpcClient, RpcClientConfig, RpcContractCaller, RpcError,
};
