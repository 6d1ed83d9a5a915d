//! Integration tests exercising the daemon's wiring end to end: config
//! construction, the `Dispatcher` registry, and JSON-RPC framing, all
//! without touching LVM/ZFS/btrfs (which require real system tooling
//! and are covered by each backend's own unit tests instead).

use std::sync::Arc;

use serde_json::json;
use targetd::{BlockManager, Config, Dispatcher, FsManager, LioStore};

async fn empty_dispatcher() -> Dispatcher {
    let config = Config {
        block_pools: Vec::new(),
        fs_pools: Vec::new(),
        zfs_block_pools: Vec::new(),
        zfs_fs_pools: Vec::new(),
        ..Config::default()
    };
    let lio = Arc::new(LioStore::new(None));
    let block = Arc::new(BlockManager::new(&config, lio).await.unwrap());
    let fs = Arc::new(FsManager::new(&config).await.unwrap());
    Dispatcher::new(block, fs)
}

#[tokio::test]
async fn pool_list_with_no_backends_returns_empty_array() {
    let dispatcher = empty_dispatcher().await;
    let body = json!({"jsonrpc": "2.0", "id": 1, "method": "pool_list"});
    let resp = dispatcher.handle(body.to_string().as_bytes()).await;
    let value = serde_json::to_value(&resp).unwrap();
    assert_eq!(value["result"], json!([]));
    assert!(value.get("error").is_none());
}

#[tokio::test]
async fn unparsable_body_yields_parse_error_with_null_id() {
    let dispatcher = empty_dispatcher().await;
    let resp = dispatcher.handle(b"not json at all").await;
    let value = serde_json::to_value(&resp).unwrap();
    assert_eq!(value["error"]["code"], -32700);
    assert_eq!(value["id"], json!(null));
}

#[tokio::test]
async fn wrong_jsonrpc_version_yields_invalid_request() {
    let dispatcher = empty_dispatcher().await;
    let body = json!({"jsonrpc": "1.0", "id": 5, "method": "pool_list"});
    let resp = dispatcher.handle(body.to_string().as_bytes()).await;
    let value = serde_json::to_value(&resp).unwrap();
    assert_eq!(value["error"]["code"], -32600);
    assert_eq!(value["id"], json!(5));
}

#[tokio::test]
async fn unknown_method_yields_method_not_found() {
    let dispatcher = empty_dispatcher().await;
    let body = json!({"jsonrpc": "2.0", "id": "abc", "method": "vol_teleport"});
    let resp = dispatcher.handle(body.to_string().as_bytes()).await;
    let value = serde_json::to_value(&resp).unwrap();
    assert_eq!(value["error"]["code"], -32601);
    assert_eq!(value["id"], json!("abc"));
}

#[tokio::test]
async fn missing_required_param_yields_invalid_argument() {
    let dispatcher = empty_dispatcher().await;
    // vol_list requires "pool"; omit it entirely.
    let body = json!({"jsonrpc": "2.0", "id": 2, "method": "vol_list", "params": {}});
    let resp = dispatcher.handle(body.to_string().as_bytes()).await;
    let value = serde_json::to_value(&resp).unwrap();
    assert_eq!(value["error"]["code"], -32602);
}

#[tokio::test]
async fn request_with_omitted_params_key_is_not_a_framing_error() {
    let dispatcher = empty_dispatcher().await;
    // nfs_export_auth_list takes no params; the key is entirely absent.
    let body = json!({"jsonrpc": "2.0", "id": 9, "method": "nfs_export_auth_list"});
    let resp = dispatcher.handle(body.to_string().as_bytes()).await;
    let value = serde_json::to_value(&resp).unwrap();
    assert!(value.get("error").is_none(), "unexpected error: {value:?}");
    assert!(value["result"].as_array().unwrap().contains(&json!("sys")));
}
