use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::core::error::{DownloadError, DownloadResult};

/// 某个存储根目录的写入授权，只在本进程内有效
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCapability {
    root: PathBuf,
    token: Uuid,
}

impl StorageCapability {
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn covers(&self, root: &Path) -> bool {
        self.root == root
    }
}

#[derive(Debug)]
enum Decision {
    Granted,
    Denied,
}

/// 授权结果的回复通道，可在任意线程上调用
#[derive(Debug)]
pub struct AuthorizationResponder {
    sender: oneshot::Sender<Decision>,
}

impl AuthorizationResponder {
    pub fn grant(self) {
        let _ = self.sender.send(Decision::Granted);
    }

    pub fn deny(self) {
        let _ = self.sender.send(Decision::Denied);
    }
}

/// 外部授权方：决定是否允许写入某个存储根目录
///
/// 实现可以立即回复，也可以把 `responder` 交给其它线程稍后回复；
/// 直接丢弃 `responder` 视为拒绝。
pub trait AuthorizationProvider: Send + Sync {
    fn request_authorization(&self, token: Uuid, root: &Path, responder: AuthorizationResponder);
}

/// 总是授权，适用于没有访问限制的本地文件系统
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoGrant;

impl AuthorizationProvider for AutoGrant {
    fn request_authorization(&self, _token: Uuid, _root: &Path, responder: AuthorizationResponder) {
        responder.grant();
    }
}

/// 授权握手：发出请求、限时等待回复，并按根目录缓存授权结果
pub struct AuthorizationBroker {
    provider: Arc<dyn AuthorizationProvider>,
    timeout: Duration,
    granted: Mutex<HashMap<PathBuf, StorageCapability>>,
}

impl AuthorizationBroker {
    pub fn new(provider: Arc<dyn AuthorizationProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            timeout,
            granted: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, root: &Path) -> Option<StorageCapability> {
        self.granted.lock().ok()?.get(root).cloned()
    }

    pub async fn acquire(&self, root: &Path) -> DownloadResult<StorageCapability> {
        if let Some(capability) = self.cached(root) {
            return Ok(capability);
        }

        let token = Uuid::new_v4();
        let (sender, receiver) = oneshot::channel();
        log::info!("请求存储授权: {} (token {})", root.display(), token);
        self.provider
            .request_authorization(token, root, AuthorizationResponder { sender });

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(Decision::Granted)) => {
                let capability = StorageCapability {
                    root: root.to_path_buf(),
                    token,
                };
                if let Ok(mut granted) = self.granted.lock() {
                    granted
                        .entry(root.to_path_buf())
                        .or_insert_with(|| capability.clone());
                }
                log::info!("存储授权已获得: {}", root.display());
                Ok(capability)
            }
            Ok(Ok(Decision::Denied)) | Ok(Err(_)) => {
                log::warn!("存储授权被拒绝: {}", root.display());
                Err(DownloadError::AuthorizationDenied {
                    root: root.to_path_buf(),
                })
            }
            Err(_) => {
                log::warn!("等待存储授权超时: {}", root.display());
                Err(DownloadError::AuthorizationTimedOut {
                    root: root.to_path_buf(),
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 记录请求次数，按预设结果回复
    pub(crate) struct ScriptedAuthorizer {
        pub calls: AtomicUsize,
        pub grant: bool,
        pub respond: bool,
    }

    impl ScriptedAuthorizer {
        pub(crate) fn new(grant: bool, respond: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                grant,
                respond,
            }
        }
    }

    impl AuthorizationProvider for ScriptedAuthorizer {
        fn request_authorization(&self, _token: Uuid, _root: &Path, responder: AuthorizationResponder) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.respond {
                // 不回复也不丢弃，模拟一直没有结果的授权界面
                std::mem::forget(responder);
                return;
            }
            // 在另一个线程上稍后回复
            let grant = self.grant;
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                if grant {
                    responder.grant();
                } else {
                    responder.deny();
                }
            });
        }
    }

    #[tokio::test]
    async fn test_grant_is_cached_per_root() {
        let provider = Arc::new(ScriptedAuthorizer::new(true, true));
        let broker = AuthorizationBroker::new(provider.clone(), Duration::from_secs(1));

        let first = broker.acquire(Path::new("/mnt/sd")).await.unwrap();
        let second = broker.acquire(Path::new("/mnt/sd")).await.unwrap();
        assert_eq!(first, second);
        assert!(first.covers(Path::new("/mnt/sd")));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        broker.acquire(Path::new("/mnt/usb")).await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_denied() {
        let broker = AuthorizationBroker::new(Arc::new(ScriptedAuthorizer::new(false, true)), Duration::from_secs(1));
        let result = broker.acquire(Path::new("/mnt/sd")).await;
        assert!(matches!(result, Err(DownloadError::AuthorizationDenied { .. })));
    }

    #[tokio::test]
    async fn test_timed_out() {
        let broker = AuthorizationBroker::new(Arc::new(ScriptedAuthorizer::new(true, false)), Duration::from_millis(50));
        let result = broker.acquire(Path::new("/mnt/sd")).await;
        assert!(matches!(
            result,
            Err(DownloadError::AuthorizationTimedOut { timeout_ms: 50, .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_responder_is_denial() {
        struct Dropper;
        impl AuthorizationProvider for Dropper {
            fn request_authorization(&self, _token: Uuid, _root: &Path, _responder: AuthorizationResponder) {}
        }
        let broker = AuthorizationBroker::new(Arc::new(Dropper), Duration::from_secs(1));
        let result = broker.acquire(Path::new("/mnt/sd")).await;
        assert!(matches!(result, Err(DownloadError::AuthorizationDenied { .. })));
    }
}
