use super::*;
use crate::entry::test_http::{closed_url, serve_once};
use tempfile::TempDir;

const HOST_TOTAL: u64 = 16 * GIB;

fn probe(dir: &TempDir) -> MemoryProbe {
    MemoryProbe {
        ecs_metadata_uri: None,
        cgroup_v2_memory_max: dir.path().join("memory.max"),
        cgroup_v1_memory_limit: dir.path().join("memory.limit_in_bytes"),
        host_total: HOST_TOTAL,
    }
}

fn write(dir: &TempDir, name: &str, content: &str) {
    std::fs::write(dir.path().join(name), content).unwrap();
}

#[test]
fn test_all_sources_absent_falls_back_to_host_total() {
    let dir = TempDir::new().unwrap();
    let limit = resolve_local(&probe(&dir), None);
    assert_eq!(limit.bytes, HOST_TOTAL);
    assert_eq!(limit.source, MemorySource::Host);
}

#[test]
fn test_ecs_value_wins_over_cgroup_files() {
    let dir = TempDir::new().unwrap();
    write(&dir, "memory.max", "1073741824\n");
    write(&dir, "memory.limit_in_bytes", "2147483648\n");
    let limit = resolve_local(&probe(&dir), Some(512 * MIB));
    assert_eq!(limit, MemoryLimit { bytes: 512 * MIB, source: MemorySource::Ecs });
}

#[test]
fn test_cgroup_v2_wins_over_v1() {
    let dir = TempDir::new().unwrap();
    write(&dir, "memory.max", "1073741824\n");
    write(&dir, "memory.limit_in_bytes", "2147483648\n");
    let limit = resolve_local(&probe(&dir), None);
    assert_eq!(limit, MemoryLimit { bytes: GIB, source: MemorySource::CgroupV2 });
}

#[test]
fn test_cgroup_v2_max_means_host_total() {
    let dir = TempDir::new().unwrap();
    write(&dir, "memory.max", "max\n");
    let limit = resolve_local(&probe(&dir), None);
    assert_eq!(limit, MemoryLimit { bytes: HOST_TOTAL, source: MemorySource::CgroupV2 });
}

#[test]
fn test_cgroup_v2_garbage_falls_through_to_v1() {
    let dir = TempDir::new().unwrap();
    write(&dir, "memory.max", "lots\n");
    write(&dir, "memory.limit_in_bytes", "2147483648\n");
    let limit = resolve_local(&probe(&dir), None);
    assert_eq!(limit, MemoryLimit { bytes: 2 * GIB, source: MemorySource::CgroupV1 });
}

#[test]
fn test_cgroup_v1_sentinels_mean_host_total() {
    for sentinel in ["9223372036854771712", "0"] {
        let dir = TempDir::new().unwrap();
        write(&dir, "memory.limit_in_bytes", sentinel);
        let limit = resolve_local(&probe(&dir), None);
        assert_eq!(
            limit,
            MemoryLimit { bytes: HOST_TOTAL, source: MemorySource::CgroupV1 },
            "sentinel {sentinel}"
        );
    }
}

#[test]
fn test_parse_ecs_task_memory() {
    let body = r#"{"Cluster":"c","Limits":{"CPU":0.5,"Memory":2048}}"#;
    assert_eq!(parse_ecs_task_memory(body).unwrap(), 2048 * MIB);
    assert!(parse_ecs_task_memory(r#"{"Limits":{"CPU":0.5}}"#).is_err());
    assert!(parse_ecs_task_memory("not json").is_err());
    assert!(parse_ecs_task_memory(r#"{"Limits":{"Memory":0}}"#).is_err());
    assert!(parse_ecs_task_memory(r#"{"Limits":{"Memory":0.5}}"#).is_err());
    assert!(parse_ecs_task_memory(r#"{"Limits":{"Memory":1e15}}"#).is_err());
    assert!(parse_ecs_task_memory(r#"{"Limits":{"Memory":1e30}}"#).is_err());
}

#[tokio::test]
async fn test_ecs_out_of_range_memory_falls_through() {
    let dir = TempDir::new().unwrap();
    write(&dir, "memory.max", "1073741824\n");
    let (url, _req) = serve_once(200, r#"{"Limits":{"Memory":1e15}}"#).await;
    let mut p = probe(&dir);
    p.ecs_metadata_uri = Some(url);
    let limit = resolve_memory_limit(&p).await;
    assert_eq!(limit, MemoryLimit { bytes: GIB, source: MemorySource::CgroupV2 });
}

#[tokio::test]
async fn test_ecs_metadata_fetch_takes_precedence() {
    let dir = TempDir::new().unwrap();
    write(&dir, "memory.max", "1073741824\n");
    let (url, req) = serve_once(200, r#"{"Limits":{"CPU":1,"Memory":3072}}"#).await;
    let mut p = probe(&dir);
    p.ecs_metadata_uri = Some(url);
    let limit = resolve_memory_limit(&p).await;
    assert_eq!(limit, MemoryLimit { bytes: 3072 * MIB, source: MemorySource::Ecs });
    let raw = req.await.unwrap();
    assert!(raw.starts_with("GET /task "), "{raw}");
}

#[tokio::test]
async fn test_ecs_non_200_falls_through() {
    let dir = TempDir::new().unwrap();
    write(&dir, "memory.max", "1073741824\n");
    let (url, _req) = serve_once(500, "{}").await;
    let mut p = probe(&dir);
    p.ecs_metadata_uri = Some(url);
    let limit = resolve_memory_limit(&p).await;
    assert_eq!(limit.source, MemorySource::CgroupV2);
}

#[tokio::test]
async fn test_ecs_unreachable_falls_through() {
    let dir = TempDir::new().unwrap();
    let mut p = probe(&dir);
    p.ecs_metadata_uri = Some(closed_url().await);
    let limit = resolve_memory_limit(&p).await;
    assert_eq!(limit.source, MemorySource::Host);
}
