//! 应用目录协作方：可启动应用清单与当前运行状态。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use serde::Deserialize;
use tracing::{info, warn};

use crate::stream::LaunchSession;

/// 一个可启动的应用。
#[derive(Debug, Clone)]
pub(crate) struct App {
    pub(crate) id: i32,
    pub(crate) name: String,
    pub(crate) image_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct AppsFile {
    #[serde(default)]
    apps: Vec<AppEntry>,
}

#[derive(Debug, Deserialize)]
struct AppEntry {
    name: String,
    #[serde(default)]
    id: Option<i32>,
    #[serde(default, rename = "image-path")]
    image_path: Option<PathBuf>,
}

/// 应用目录与启动器；`running` 为当前运行的 appid，0 表示空闲。
pub(crate) struct AppCatalog {
    apps: Vec<App>,
    running: AtomicI32,
}

impl AppCatalog {
    /// 从配置文件加载；缺失或损坏时回退到内置 Desktop 项。
    pub(crate) fn load(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<AppsFile>(&raw) {
                Ok(parsed) => parsed.apps,
                Err(err) => {
                    warn!("decode apps file {} failed: {err}", path.display());
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        if entries.is_empty() {
            return Self::from_apps(vec![App {
                id: 1,
                name: "Desktop".to_string(),
                image_path: None,
            }]);
        }

        let apps = entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| App {
                id: entry.id.unwrap_or(index as i32 + 1),
                name: entry.name,
                image_path: entry.image_path,
            })
            .collect();
        Self::from_apps(apps)
    }

    pub(crate) fn from_apps(apps: Vec<App>) -> Self {
        Self {
            apps,
            running: AtomicI32::new(0),
        }
    }

    pub(crate) fn apps(&self) -> &[App] {
        &self.apps
    }

    pub(crate) fn find(&self, appid: i32) -> Option<&App> {
        self.apps.iter().find(|app| app.id == appid)
    }

    /// 当前运行的 appid，空闲时为 0。
    pub(crate) fn running(&self) -> i32 {
        self.running.load(Ordering::SeqCst)
    }

    /// 启动应用；返回 0 表示成功，非 0 为透传给客户端的错误码。
    pub(crate) fn execute(&self, appid: i32, app: &App, session: &LaunchSession) -> u16 {
        info!(
            "launching app {} [{}] for device {}",
            app.name, appid, session.device_name
        );
        self.running.store(appid, Ordering::SeqCst);
        0
    }

    /// 终止当前运行的应用。
    pub(crate) fn terminate(&self) {
        let appid = self.running.swap(0, Ordering::SeqCst);
        if appid != 0 {
            info!("terminated app [{appid}]");
        }
    }

    /// 测试与恢复路径使用：直接标记运行中的应用。
    pub(crate) fn mark_running(&self, appid: i32) {
        self.running.store(appid, Ordering::SeqCst);
    }

    /// 应用封面图路径。
    pub(crate) fn image(&self, appid: i32) -> Option<PathBuf> {
        self.find(appid).and_then(|app| app.image_path.clone())
    }
}
