//! Kubernetes 集群访问模块
//!
//! 服务监听器只需要对 Service 和 Pod 做 Get/List/Watch，全部通过 [`ClusterClient`]
//! 完成。生产实现基于 `kube::Api`，监听事件通过通道转发为 `'static` 流。

use std::fmt::Debug;

use async_trait::async_trait;
use chaosnet_common::{Error, Result};
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::Client;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

/// 监听事件流
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// 监听事件通道的缓冲区大小
const WATCH_BUFFER: usize = 64;

/// Kubernetes 集群客户端
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// 获取服务
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;

    /// 按标签选择器列出 Pod，同时返回列表的 resourceVersion
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<(Vec<Pod>, String)>;

    /// 从指定 resourceVersion 开始监听单个服务
    async fn watch_services(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
    ) -> Result<WatchStream<Service>>;

    /// 从指定 resourceVersion 开始监听标签选择器匹配的 Pod
    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<WatchStream<Pod>>;
}

/// 基于 kube 客户端的实现
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// 使用已有客户端创建
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// 从集群内配置或 kubeconfig 推断客户端
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Kubernetes(format!("创建 Kubernetes 客户端失败: {}", e)))?;

        Ok(Self::new(client))
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);

        api.get(name)
            .await
            .map_err(|e| Error::Kubernetes(format!("获取服务 {}/{} 失败: {}", namespace, name, e)))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<(Vec<Pod>, String)> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| {
                Error::Kubernetes(format!(
                    "列出 Pod 失败 ({} / {}): {}",
                    namespace, label_selector, e
                ))
            })?;

        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        Ok((list.items, resource_version))
    }

    async fn watch_services(
        &self,
        namespace: &str,
        name: &str,
        resource_version: &str,
    ) -> Result<WatchStream<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let params = WatchParams::default().fields(&format!("metadata.name={}", name));

        Ok(forward_watch(api, params, resource_version.to_string()))
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
        resource_version: &str,
    ) -> Result<WatchStream<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = WatchParams::default().labels(label_selector);

        Ok(forward_watch(api, params, resource_version.to_string()))
    }
}

/// 在后台任务中打开监听并把事件转发到通道；接收端被丢弃时任务随之退出
fn forward_watch<K>(api: Api<K>, params: WatchParams, resource_version: String) -> WatchStream<K>
where
    K: Clone + DeserializeOwned + Debug + Send + 'static,
{
    let (mut tx, rx) = mpsc::channel(WATCH_BUFFER);

    tokio::spawn(async move {
        let stream = match api.watch(&params, &resource_version).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = tx.send(Err(Error::Watch(format!("打开监听失败: {}", e)))).await;
                return;
            }
        };
        futures::pin_mut!(stream);

        while let Some(event) = stream.next().await {
            let event = event.map_err(|e| Error::Watch(e.to_string()));
            if tx.send(event).await.is_err() {
                debug!("监听事件接收端已关闭");
                return;
            }
        }

        warn!("Kubernetes 监听通道已关闭");
    });

    rx.boxed()
}

/// 将标签映射格式化为 `k=v,k2=v2` 选择器
pub fn label_selector<'a>(labels: impl IntoIterator<Item = (&'a String, &'a String)>) -> String {
    labels
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_label_selector_format() {
        let labels = BTreeMap::from([
            ("app".to_string(), "backend".to_string()),
            ("tier".to_string(), "api".to_string()),
        ]);
        assert_eq!(label_selector(&labels), "app=backend,tier=api");
        assert_eq!(label_selector(&BTreeMap::<String, String>::new()), "");
    }
}
