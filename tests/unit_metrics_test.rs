// tests/unit_metrics_test.rs

mod common;

use std::sync::Arc;

use common::build_system;
use serde_json::{Value, json};

use stratacache::core::tier2::MemoryTier2;

#[tokio::test(start_paused = true)]
async fn collection_composes_the_global_view() {
    let t2 = Arc::new(MemoryTier2::new());
    let system = build_system(t2).await;

    system
        .sessions()
        .set_user_session(1, &json!({"id": 1}))
        .await
        .unwrap();
    // Two hits and one miss across the caches.
    system.sessions().get_user_session::<Value>(1).await;
    system.sessions().get_user_session::<Value>(1).await;
    system.sessions().get_user_session::<Value>(404).await;

    let snapshot = system.aggregator().collect_cycle().await;
    assert!((snapshot.global_hit_ratio - 2.0 / 3.0).abs() < 1e-9);
    assert!(snapshot.rps > 0.0);
    assert!(snapshot.error_rate == 0.0);

    let report = system.aggregator().latest_report().expect("report");
    assert!(report.health_score >= 0.0 && report.health_score <= 100.0);
    assert_eq!(report.prediction.confidence, 0.5);
}

#[tokio::test(start_paused = true)]
async fn low_hit_ratio_raises_insight_and_strategy_bottleneck() {
    let t2 = Arc::new(MemoryTier2::new());
    let system = build_system(t2).await;

    for id in 0..10u64 {
        system.sessions().get_user_session::<Value>(id).await;
    }

    let snapshot = system.aggregator().collect_cycle().await;
    assert_eq!(snapshot.global_hit_ratio, 0.0);

    let report = system.aggregator().latest_report().expect("report");
    assert!(
        report
            .insights
            .iter()
            .any(|i| i.message.contains("hit ratio"))
    );
    assert!(!report.bottlenecks.is_empty());
    // 100 - (0.9 - 0.0) * 50 - insight penalties stays well below perfect.
    assert!(report.health_score < 60.0);
}

#[tokio::test(start_paused = true)]
async fn prediction_confidence_grows_with_history() {
    let t2 = Arc::new(MemoryTier2::new());
    let system = build_system(t2).await;

    for _ in 0..10 {
        system.aggregator().collect_cycle().await;
    }
    let report = system.aggregator().latest_report().expect("report");
    assert_eq!(report.prediction.confidence, 0.7);
    assert_eq!(system.aggregator().history().len(), 10);
}

#[tokio::test(start_paused = true)]
async fn hot_spots_surface_top_query_keys() {
    let t2 = Arc::new(MemoryTier2::new());
    let system = build_system(t2).await;

    for _ in 0..4 {
        system
            .queries()
            .execute_with_cache(
                "SELECT * FROM users WHERE id=$1",
                &[Value::from(1)],
                |_sql, _params| async { Ok(json!([1])) },
            )
            .await
            .unwrap();
    }

    system.aggregator().collect_cycle().await;
    let report = system.aggregator().latest_report().expect("report");
    assert_eq!(report.hot_spots.len(), 1);
    assert_eq!(report.hot_spots[0].1, 4);
    assert!(report.hot_spots[0].0.starts_with("query:"));
}

#[tokio::test(start_paused = true)]
async fn idle_system_reports_full_health() {
    let t2 = Arc::new(MemoryTier2::new());
    let system = build_system(t2).await;

    system.aggregator().collect_cycle().await;
    let report = system.aggregator().latest_report().expect("report");
    assert_eq!(report.health_score, 100.0);
    assert!(report.insights.is_empty());
}
