//! Loopback self-test

use anyhow::{ensure, Context, Result};
use libnyx_offload::loopback::Loopback;
use libnyx_offload::translate::{MAP_INFO_SIZE, PACKET_HEADER_SIZE, SLOT_SIZE};
use libnyx_offload::{
    ConnectionState, OffloadConfig, OffloadContext, OffloadError, OpenFlags, ServiceStatus,
    SessionInfo, TimerSnapshot,
};
use serde::Serialize;
use std::future::Future;
use tracing::{error, info};

const SCRATCH_FD: i32 = 3;
const FRAME_FD: i32 = 4;

/// Outcome of one self-test step
#[derive(Debug, Serialize)]
pub struct Step {
    pub name: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Self-test report
#[derive(Debug, Default, Serialize)]
pub struct Report {
    pub steps: Vec<Step>,
    pub session: Option<SessionInfo>,
    pub timer: Option<TimerSnapshot>,
    pub services: Vec<ServiceStatus>,
}

impl Report {
    pub fn passed(&self) -> bool {
        self.steps.iter().all(|step| step.ok)
    }

    async fn step<F, T>(&mut self, name: &'static str, run: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        match run.await {
            Ok(value) => {
                info!("[ok]   {}", name);
                self.steps.push(Step {
                    name,
                    ok: true,
                    detail: None,
                });
                Some(value)
            }
            Err(e) => {
                error!("[fail] {}: {:#}", name, e);
                self.steps.push(Step {
                    name,
                    ok: false,
                    detail: Some(format!("{:#}", e)),
                });
                None
            }
        }
    }

    pub fn print(&self) {
        println!("{:<32} {:<6}", "STEP", "RESULT");
        println!("{}", "-".repeat(40));
        for step in &self.steps {
            println!(
                "{:<32} {:<6} {}",
                step.name,
                if step.ok { "ok" } else { "FAIL" },
                step.detail.as_deref().unwrap_or("")
            );
        }

        if let Some(timer) = &self.timer {
            println!();
            println!("Timer:      {} ({} @32k)", timer.persistent_timer, timer.clock32k);
        }
        for service in &self.services {
            let minor = service
                .minor
                .map_or_else(|| "-".to_string(), |minor| minor.to_string());
            println!(
                "Service:    {} (minor {}, bound: {}, connections: {}, bindings: {})",
                service.name, minor, service.bound, service.connections, service.bindings
            );
        }
    }
}

fn packet(slots: &[u32]) -> Vec<u8> {
    let mut payload = vec![0u8; PACKET_HEADER_SIZE];
    payload.extend_from_slice(&(slots.len() as u32).to_le_bytes());
    payload.extend_from_slice(&(MAP_INFO_SIZE as i32).to_le_bytes());
    for slot in slots {
        payload.extend_from_slice(&slot.to_le_bytes());
    }
    payload
}

fn slot(payload: &[u8], index: usize) -> Option<u32> {
    let at = PACKET_HEADER_SIZE + MAP_INFO_SIZE + index * SLOT_SIZE;
    payload
        .get(at..at + SLOT_SIZE)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_le_bytes)
}

/// Run the full lifecycle against a fresh loopback remote processor
pub async fn run(config: OffloadConfig, service: &str) -> Result<Report> {
    let remote = Loopback::new(service);
    remote.memory.add_contiguous(SCRATCH_FD, 0x8000_4000, 4096);
    remote
        .memory
        .add_scattered(FRAME_FD, vec![0x8120_0000, 0x8340_1000, 0x8000_9000]);

    let ctx = OffloadContext::new(config, remote.platform()).context("initializing bridge")?;
    ctx.bind_channel(service, remote.link())?;

    let mut report = Report::default();
    let session = ctx.open(service, OpenFlags::blocking()).await?;

    report
        .step("connect", async {
            session.connect("OMX").await?;
            ensure!(session.state() == ConnectionState::Connected, "not connected");
            Ok(())
        })
        .await;

    let handles = report
        .step("register buffers", async {
            let scratch = session.register_buffer(SCRATCH_FD)?;
            let frame = session.register_buffer(FRAME_FD)?;
            Ok((scratch, frame))
        })
        .await;

    if let Some((scratch, frame)) = handles {
        report
            .step("translated echo", async {
                session.write(&packet(&[scratch.raw(), 0, frame.raw()]))?;
                let mut reply = [0u8; 64];
                let n = session.read(&mut reply).await?;
                let reply = &reply[..n];

                let table = slot(reply, 2).context("short echo")?;
                ensure!(slot(reply, 0) == Some(0xA000_4000), "scratch not translated");
                ensure!(slot(reply, 1) == Some(0), "absent reference rewritten");
                ensure!(
                    remote.memory.page_table(table).map(|t| t.len()) == Some(3),
                    "frame table at {:#x} not found",
                    table
                );
                Ok(())
            })
            .await;

        report
            .step("unregister", async {
                session.unregister_buffer(scratch)?;
                match session.unregister_buffer(scratch) {
                    Err(OffloadError::StaleHandle(_)) => Ok(()),
                    other => anyhow::bail!("double unregister returned {:?}", other),
                }
            })
            .await;
    }

    report.timer = report
        .step("timer", async { Ok(session.timer()) })
        .await;
    report.session = Some(session.info());

    report
        .step("crash", async {
            ctx.on_channel_lost(service);
            ensure!(session.state() == ConnectionState::Failed, "session survived crash");
            match session.write(b"after crash") {
                Err(OffloadError::Unreachable) => Ok(()),
                other => anyhow::bail!("write after crash returned {:?}", other),
            }
        })
        .await;
    session.close();

    report
        .step("recover", async {
            let recovered = remote.recovered();
            ctx.bind_channel(service, recovered.link())?;
            let session = ctx.open(service, OpenFlags::nonblocking()).await?;
            session.connect("OMX").await?;
            session.write(b"ping")?;
            let mut reply = [0u8; 8];
            let n = session.read(&mut reply).await?;
            ensure!(&reply[..n] == b"ping", "unexpected echo");
            Ok(())
        })
        .await;

    report.services = ctx.services();
    ctx.shutdown();
    ensure!(
        remote.memory.live_handles() == 0,
        "{} buffer handles leaked",
        remote.memory.live_handles()
    );

    Ok(report)
}
