use std::sync::Arc;

use crate::config::Config;
use crate::core::error::DownloadResult;
use crate::net::{ConnectionClient, HttpConnectionClient};
use crate::persistence::{JsonFileStore, NoopStore, PersistenceStore};
use crate::storage::{AuthorizationProvider, FsStorageGateway, StorageGateway};

/// 引擎运行所需的全部依赖，启动时构建一次后共享
pub struct EngineContext {
    pub config: Config,
    pub client: Arc<dyn ConnectionClient>,
    pub storage: Arc<dyn StorageGateway>,
    pub store: Arc<dyn PersistenceStore>,
}

/// `EngineContext` 构建器
///
/// 授权方是必需的；连接客户端、存储网关和记录存储可以替换，
/// 不替换时分别使用 reqwest 客户端、本地文件系统和 JSON 文件。
pub struct EngineBuilder {
    config: Config,
    authorizer: Arc<dyn AuthorizationProvider>,
    client: Option<Arc<dyn ConnectionClient>>,
    storage: Option<Arc<dyn StorageGateway>>,
    store: Option<Arc<dyn PersistenceStore>>,
}

impl EngineBuilder {
    pub fn new(config: Config, authorizer: Arc<dyn AuthorizationProvider>) -> Self {
        Self {
            config,
            authorizer,
            client: None,
            storage: None,
            store: None,
        }
    }

    pub fn connection_client(mut self, client: Arc<dyn ConnectionClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageGateway>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// 关闭持久化时这里设置的存储不会被使用
    pub fn store(mut self, store: Arc<dyn PersistenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> DownloadResult<EngineContext> {
        self.config.validate()?;

        let client: Arc<dyn ConnectionClient> = match self.client {
            Some(client) => client,
            None => Arc::new(HttpConnectionClient::new()?),
        };
        let storage: Arc<dyn StorageGateway> = match self.storage {
            Some(storage) => storage,
            None => Arc::new(
                FsStorageGateway::new(self.authorizer, self.config.authorization_timeout())
                    .with_protected_roots(self.config.protected_roots.clone()),
            ),
        };
        let store: Arc<dyn PersistenceStore> = if !self.config.persistence_enabled {
            Arc::new(NoopStore)
        } else {
            match self.store {
                Some(store) => store,
                None => Arc::new(JsonFileStore::open(&self.config.state_file)?),
            }
        };

        log::info!("下载引擎配置完成，并发数 {}", self.config.max_concurrent_downloads);
        Ok(EngineContext {
            config: self.config,
            client,
            storage,
            store,
        })
    }
}
