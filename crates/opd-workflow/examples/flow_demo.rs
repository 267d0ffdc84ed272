//! 门诊流程演示程序
//!
//! 展示取号、负载均衡、优先级排队、报到完成和阶段交接

use opd_core::{
    Doctor, Patient, PatientClass, Stage, Station, StationKey, SystemClock,
};
use opd_workflow::{BroadcastSink, FanoutSink, FlowOrchestrator, MemoryStore, SeedData, TracingSink};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt::init();

    // 创建存储与编排引擎
    let store = Arc::new(MemoryStore::with_seed(sample_seed()).await?);
    let broadcast = Arc::new(BroadcastSink::new(64));
    let mut events = broadcast.subscribe();
    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(broadcast.clone());
    let engine = FlowOrchestrator::resume(store, Arc::new(SystemClock))
        .await?
        .with_events(Arc::new(sink));

    println!("🚀 门诊流程演示\n");

    // 1. 取号
    let mut tokens = Vec::new();
    for (uhid, doctor) in [("U100", "D1"), ("U101", "D1"), ("U102", "D2"), ("U103", "D1")] {
        let admission = engine.admit(uhid, doctor).await?;
        println!(
            "📋 患者 {} 取号 {} → {} (队列位置 {})",
            uhid, admission.token.id, admission.station, admission.position
        );
        tokens.push(admission);
    }

    // 2. 分诊队列
    println!("\n📊 分诊队列:");
    for entry in engine.list_stage_queue(Stage::Intake).await? {
        println!(
            "   - {} #{} 患者 {}",
            entry.station,
            entry.token.number,
            entry.patient_id.as_deref().unwrap_or("-")
        );
    }

    // 3. 依次完成三个阶段
    let first = &tokens[0];
    let mut station = first.station;
    loop {
        engine.report_at_station(station, first.token.id).await?;
        let finished = engine.finish_at_station(station, first.token.id).await?;
        println!("✅ {} 在 {} 完成: {:?}", first.token.id, station, finished.handoff);
        match finished.handoff {
            opd_workflow::Handoff::Queued { station: next, .. } => station = next,
            _ => break,
        }
    }

    // 4. 停用有排队号码的分诊台
    let busy = tokens[1].station;
    let transition = engine.set_station_active(busy, false).await?;
    println!("\n⚠️  停用 {}: {:?}", busy, transition);

    // 5. 新增药房
    let added = engine
        .add_station(Stage::Pharmacy, Some("东侧药房".to_string()), None)
        .await?;
    println!("➕ 新增工位 {} ({:?})", added.key, added.status);

    // 6. 事件回放
    println!("\n📨 已发布事件:");
    while let Ok(event) = events.try_recv() {
        println!("   - {}", event.as_str());
    }

    println!("\n🎉 门诊流程演示完成!");
    Ok(())
}

/// 示例种子数据
fn sample_seed() -> SeedData {
    let patient = |uhid: &str, name: &str, class: PatientClass| Patient {
        uhid: uhid.to_string(),
        name: name.to_string(),
        class,
        age: Some(35),
        blood_group: Some("O+".to_string()),
        phone_number: None,
    };
    let doctor = |id: &str, name: &str, room: u32| Doctor {
        doctor_id: id.to_string(),
        name: name.to_string(),
        specialty: Some("全科".to_string()),
        is_active: true,
        room: Some(room),
    };
    let mut room_one = Station::new(StationKey::new(Stage::Consultation, 1), Some("101".into()));
    room_one.doctor_id = Some("D1".to_string());
    let mut room_two = Station::new(StationKey::new(Stage::Consultation, 2), Some("102".into()));
    room_two.doctor_id = Some("D2".to_string());

    SeedData {
        patients: vec![
            patient("U100", "张三", PatientClass::Regular),
            patient("U101", "李四", PatientClass::Vip),
            patient("U102", "王五", PatientClass::Emergency),
            patient("U103", "赵六", PatientClass::Unclassified),
        ],
        doctors: vec![doctor("D1", "张医生", 1), doctor("D2", "李医生", 2)],
        stations: vec![
            Station::new(StationKey::new(Stage::Intake, 1), Some("一楼大厅".into())),
            Station::new(StationKey::new(Stage::Intake, 2), Some("二楼大厅".into())),
            room_one,
            room_two,
            Station::new(StationKey::new(Stage::Pharmacy, 1), Some("西侧药房".into())),
        ],
    }
}
