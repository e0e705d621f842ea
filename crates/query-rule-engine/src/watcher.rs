//! 规则文件热加载
//!
//! 监听规则文档所在目录的文件事件，经 debounce 窗口去抖后从持久化后端重新加载。
//! 重新加载失败时保留当前规则集。

use crate::store::RuleStore;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use semlayer_shared::config::EngineConfig;
use semlayer_shared::observability::metrics as engine_metrics;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// 规则源监听器
#[async_trait]
pub trait RuleWatcher: Send + Sync {
    /// 启动监听，返回时监听已生效
    async fn start(&self) -> Result<()>;

    /// 停止监听并释放资源
    async fn stop(&self) -> Result<()>;
}

/// 基于文件系统事件的规则文件监听器
///
/// 监听父目录而不是文件本身，编辑器或部署工具以重命名方式替换文件时也能收到事件。
pub struct RuleFileWatcher {
    store: RuleStore,
    path: PathBuf,
    debounce: Duration,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RuleFileWatcher {
    pub fn new(store: RuleStore, path: impl AsRef<Path>, debounce: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            path: path.as_ref().to_path_buf(),
            debounce,
            watcher: Mutex::new(None),
            task: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// 从引擎配置构建（rules_path + watch_debounce_ms）
    pub fn from_config(store: RuleStore, config: &EngineConfig) -> Self {
        Self::new(
            store,
            &config.rules_path,
            Duration::from_millis(config.watch_debounce_ms),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn watch_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

#[async_trait]
impl RuleWatcher for RuleFileWatcher {
    async fn start(&self) -> Result<()> {
        use notify::{EventKind, RecursiveMode, Watcher};

        let file_name: OsString = self
            .path
            .file_name()
            .with_context(|| format!("规则文件路径无效: {}", self.path.display()))?
            .to_os_string();
        let watch_dir = self.watch_dir();

        // notify 回调运行在它自己的线程，通过 channel 转发到 tokio 任务
        let (event_tx, mut event_rx) = mpsc::channel::<()>(16);

        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let relevant = matches!(
                        event.kind,
                        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                    ) && event
                        .paths
                        .iter()
                        .any(|p| p.file_name() == Some(file_name.as_os_str()));
                    if relevant {
                        let _ = event_tx.try_send(());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "文件监听器事件错误");
                }
            },
        )
        .context("创建文件监听器失败")?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("启动文件监听失败: {}", watch_dir.display()))?;
        *self.watcher.lock() = Some(watcher);

        info!(path = %self.path.display(), "规则文件监听已启动");

        let store = self.store.clone();
        let debounce = self.debounce;
        let path = self.path.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(()) = event_rx.recv() => {
                        // 等待窗口期，丢弃窗口内的后续事件
                        tokio::time::sleep(debounce).await;
                        while event_rx.try_recv().is_ok() {}

                        match store.load() {
                            Ok(count) => {
                                engine_metrics::record_reload(true);
                                info!(
                                    path = %path.display(),
                                    rules = count,
                                    version = store.version(),
                                    "规则文件变更，已重新加载"
                                );
                            }
                            Err(e) => {
                                engine_metrics::record_reload(false);
                                error!(
                                    path = %path.display(),
                                    error = %e,
                                    "规则文件重新加载失败，保留当前规则集"
                                );
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("规则文件监听已停止");
                            break;
                        }
                    }
                    else => break,
                }
            }
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.watcher.lock().take();

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RuleFileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleFileWatcher")
            .field("path", &self.path)
            .field("debounce", &self.debounce)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::models::{Action, BusinessRule, Condition, RuleType};
    use crate::persistence::{JsonFilePersistence, RuleDocument};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_store(path: &Path) -> RuleStore {
        RuleStore::new(
            Arc::new(JsonFilePersistence::new(path)),
            Arc::new(SystemClock),
        )
    }

    fn document(ids: &[&str]) -> String {
        let rules = ids
            .iter()
            .map(|id| {
                BusinessRule::new(
                    *id,
                    RuleType::QueryPattern,
                    Condition::expression("true"),
                    Action::allow(),
                )
                .with_id(*id)
            })
            .collect();
        RuleDocument::new(rules).to_json().unwrap()
    }

    async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[test]
    fn test_watch_dir_for_bare_file_name() {
        let watcher = RuleFileWatcher::new(RuleStore::in_memory(), "rules.json", Duration::ZERO);
        assert_eq!(watcher.watch_dir(), PathBuf::from("."));

        let nested = RuleFileWatcher::new(
            RuleStore::in_memory(),
            "config/rules.json",
            Duration::ZERO,
        );
        assert_eq!(nested.watch_dir(), PathBuf::from("config"));
    }

    #[tokio::test]
    async fn test_reload_on_change_and_keep_on_failure() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, document(&["a"])).unwrap();

        let store = create_store(&path);
        store.load().unwrap();
        assert_eq!(store.len(), 1);

        let watcher = RuleFileWatcher::new(store.clone(), &path, Duration::from_millis(50));
        watcher.start().await.unwrap();

        std::fs::write(&path, document(&["a", "b"])).unwrap();
        assert!(wait_for(|| store.len() == 2).await);
        // 等待同一次写入产生的后续事件处理完
        tokio::time::sleep(Duration::from_millis(300)).await;

        let version = store.version();
        std::fs::write(&path, "[{ not json").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.len(), 2);
        assert_eq!(store.version(), version);

        watcher.stop().await.unwrap();
    }
}
