//! Client 集成测试（HubClient / AgentReplica）

#[cfg(all(feature = "hub", feature = "client"))]
mod tests {
    use escalation_hub::client::{AgentReplica, ClientConfig, HubClient};
    use escalation_hub::config::StoreConfig;
    use escalation_hub::hub::{Hub, HubConfig};
    use escalation_hub::protocol::{Push, Role};
    use escalation_hub::store::{SqliteStore, Store};
    use escalation_hub::types::KnowledgeEntry;
    use escalation_hub::normalize_question;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::task::JoinHandle;
    use tokio::time::{sleep, timeout};

    fn test_dirs() -> (HubConfig, ClientConfig) {
        let data_dir: PathBuf = tempdir().unwrap().keep();

        let hub_config = HubConfig {
            data_dir: data_dir.clone(),
            request_timeout_secs: 3600,
            sweep_interval_secs: 3600,
            ping_interval_secs: 3600,
            max_missed_pings: 3,
        };

        let client_config = ClientConfig {
            data_dir,
            component: "test".to_string(),
            version: "1.0.0".to_string(),
            connect_retries: 3,
            retry_interval_ms: 100,
            reconnect_base_ms: 100,
            reconnect_max_ms: 1000,
        };

        (hub_config, client_config)
    }

    async fn start_hub(config: HubConfig) -> JoinHandle<()> {
        let hub = Arc::new(Hub::new(config).unwrap());
        let handle = tokio::spawn(async move {
            hub.run().await.unwrap();
        });
        sleep(Duration::from_millis(300)).await;
        handle
    }

    async fn expect_push(client: &mut HubClient) -> Push {
        timeout(Duration::from_secs(5), client.recv_push())
            .await
            .expect("push timed out")
            .expect("connection closed")
    }

    #[tokio::test]
    async fn test_hub_client_escalate_and_resolve() {
        let (hub_config, client_config) = test_dirs();
        let hub = start_hub(hub_config).await;

        let mut agent = HubClient::connect(&client_config, Role::Agent).await.unwrap();
        let mut observer = HubClient::connect(&client_config, Role::Observer)
            .await
            .unwrap();

        // 握手后的 Bootstrap 推送
        assert!(matches!(expect_push(&mut agent).await, Push::KbSnapshot(_)));
        assert!(matches!(
            expect_push(&mut observer).await,
            Push::PendingRequests(_)
        ));
        assert!(matches!(
            expect_push(&mut observer).await,
            Push::StatsUpdate(_)
        ));

        // 完整升级 → 解决流程
        let request_id = agent
            .escalate("Do you offer botox?", "+15551234567")
            .await
            .unwrap();
        assert!(!request_id.is_empty());

        match expect_push(&mut observer).await {
            Push::NewRequest(request) => assert_eq!(request.id, request_id),
            other => panic!("Expected NewRequest, got {:?}", other),
        }
        let _ = expect_push(&mut observer).await; // stats_update

        observer
            .resolve(&request_id, "No, we do not offer botox.", "admin")
            .await
            .unwrap();

        match expect_push(&mut agent).await {
            Push::KbUpdated(entry) => {
                assert_eq!(entry.normalized_key, "do you offer botox");
                assert_eq!(entry.answer, "No, we do not offer botox.");
            }
            other => panic!("Expected KbUpdated, got {:?}", other),
        }

        hub.abort();
    }

    #[tokio::test]
    async fn test_hub_client_resolve_conflict_is_error() {
        let (hub_config, client_config) = test_dirs();
        let hub = start_hub(hub_config).await;

        let mut agent = HubClient::connect(&client_config, Role::Agent).await.unwrap();
        let mut observer = HubClient::connect(&client_config, Role::Observer)
            .await
            .unwrap();

        let request_id = agent.escalate("q", "c").await.unwrap();

        observer.resolve(&request_id, "first", "admin1").await.unwrap();
        let err = observer
            .resolve(&request_id, "second", "admin2")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("409"));

        hub.abort();
    }

    #[tokio::test]
    async fn test_connect_fails_without_hub() {
        let (_hub_config, client_config) = test_dirs();

        // Hub 未启动，重试耗尽后报错
        let result = HubClient::connect(&client_config, Role::Agent).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_replica_bootstrap_and_patches() {
        let (hub_config, client_config) = test_dirs();
        let hub = start_hub(hub_config).await;

        // 预先沉淀一条知识
        let mut agent = HubClient::connect(&client_config, Role::Agent).await.unwrap();
        let mut observer = HubClient::connect(&client_config, Role::Observer)
            .await
            .unwrap();
        let request_id = agent.escalate("Do you offer botox?", "c1").await.unwrap();
        observer
            .resolve(&request_id, "No, we do not.", "admin")
            .await
            .unwrap();

        // 副本启动：快照 Bootstrap
        let replica = AgentReplica::new(client_config.clone());
        let handle = replica.handle();
        let replica_task = tokio::spawn(replica.run());
        sleep(Duration::from_millis(500)).await;

        // 等价形式命中（大小写 / 标点归一化）
        let hit = handle.lookup("  DO you offer Botox?! ").unwrap();
        assert_eq!(hit.answer, "No, we do not.");

        // 新知识以补丁到达
        let request_id = agent.escalate("What are your hours?", "c2").await.unwrap();
        observer
            .resolve(&request_id, "9am to 5pm, Monday to Friday.", "admin")
            .await
            .unwrap();
        sleep(Duration::from_millis(500)).await;

        let hit = handle.lookup("what are your hours").unwrap();
        assert_eq!(hit.answer, "9am to 5pm, Monday to Friday.");
        assert_eq!(handle.cache().len(), 2);

        replica_task.abort();
        hub.abort();
    }

    #[tokio::test]
    async fn test_replica_connects_when_hub_starts_late() {
        let (hub_config, client_config) = test_dirs();

        // 先落一条知识到库里（Hub 未运行）
        let db_path = hub_config.db_path();
        std::fs::create_dir_all(db_path.parent().unwrap()).unwrap();
        {
            let store = SqliteStore::open(&StoreConfig::local(db_path)).unwrap();
            let entry = KnowledgeEntry::from_answer(
                "Do you take walk-ins?",
                &normalize_question("Do you take walk-ins?"),
                "Yes, walk-ins are welcome.",
            );
            store.put_knowledge_entry(&entry).unwrap();
        }

        // 副本先启动：连接失败 → 退避重试，本地缓存为空
        let replica = AgentReplica::new(client_config);
        let handle = replica.handle();
        let replica_task = tokio::spawn(replica.run());
        sleep(Duration::from_millis(300)).await;
        assert!(handle.lookup("do you take walk-ins").is_none());

        // Hub 启动后副本自动接入并 Bootstrap
        let hub = start_hub(hub_config).await;
        sleep(Duration::from_secs(2)).await;

        let hit = handle.lookup("Do you take WALK-INS?").unwrap();
        assert_eq!(hit.answer, "Yes, walk-ins are welcome.");

        replica_task.abort();
        hub.abort();
    }

    #[tokio::test]
    async fn test_replica_serves_stale_cache() {
        let (hub_config, client_config) = test_dirs();
        let hub = start_hub(hub_config).await;

        let mut agent = HubClient::connect(&client_config, Role::Agent).await.unwrap();
        let mut observer = HubClient::connect(&client_config, Role::Observer)
            .await
            .unwrap();
        let request_id = agent.escalate("q", "c").await.unwrap();
        observer.resolve(&request_id, "the answer", "admin").await.unwrap();

        let replica = AgentReplica::new(client_config);
        let handle = replica.handle();
        let replica_task = tokio::spawn(replica.run());
        sleep(Duration::from_millis(500)).await;
        assert_eq!(handle.cache().len(), 1);

        // Hub 下线；副本继续用本地缓存服务（陈旧但可用）
        hub.abort();
        sleep(Duration::from_millis(300)).await;

        let hit = handle.lookup("q").unwrap();
        assert_eq!(hit.answer, "the answer");

        replica_task.abort();
    }
}
