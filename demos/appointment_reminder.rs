//! Appointment reminder example.
//!
//! An appointment enqueues an SMS reminder when it is booked, moves the
//! reminder when the appointment moves, and cancels it when the appointment
//! is deleted. Uses the in-memory store unless `BELAY_REDIS_URL` is set.

use async_trait::async_trait;
use belay::prelude::*;
use belay::{LogNotifier, Settings};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Seconds before the appointment that the reminder goes out.
const REMINDER_LEAD_SECS: i64 = 2;

#[derive(Debug, Clone)]
struct Appointment {
    id: u64,
    name: String,
    phone: String,
    time: DateTime<Utc>,
}

impl Appointment {
    fn owner(&self) -> Owner {
        Owner::new("Appointment", self.id)
    }

    fn reminder_at(&self) -> DateTime<Utc> {
        self.time - Duration::seconds(REMINDER_LEAD_SECS)
    }

    fn reminder(&self) -> SendReminder {
        SendReminder {
            phone: self.phone.clone(),
            body: format!(
                "Hi {}. Just a reminder that you have an appointment coming up at {}.",
                self.name,
                self.time.format("%H:%M:%S")
            ),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SendReminder {
    phone: String,
    body: String,
}

#[async_trait]
impl Perform for SendReminder {
    const KIND: &'static str = "send_reminder";
    type Context = Arc<dyn Notifier>;

    fn queue_name(&self) -> &str {
        "sms"
    }

    async fn perform(&self, notifier: &Arc<dyn Notifier>) -> Result<(), JobError> {
        notifier
            .send(&SmsMessage::new(&self.phone, &self.body))
            .await?;
        Ok(())
    }
}

/// Appointment repository that keeps its reminder in step on every change.
struct Appointments {
    queue: Queue,
    rows: HashMap<u64, Appointment>,
}

impl Appointments {
    async fn create(&mut self, appointment: Appointment) -> QueueResult<()> {
        let job = NewJob::from_perform(&appointment.reminder())
            .map_err(|e| QueueError::Serialization(e.to_string()))?
            .owned_by(appointment.owner())
            .schedule_at(appointment.reminder_at());
        let id = self.queue.enqueue(job).await?;

        info!("Booked {} with reminder job {}", appointment.name, id);
        self.rows.insert(appointment.id, appointment);
        Ok(())
    }

    async fn reschedule(&mut self, id: u64, time: DateTime<Utc>) -> QueueResult<()> {
        let Some(appointment) = self.rows.get_mut(&id) else {
            return Ok(());
        };
        appointment.time = time;

        let job = NewJob::from_perform(&appointment.reminder())
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        match self
            .queue
            .schedule_for(&appointment.owner(), appointment.reminder_at(), job)
            .await?
        {
            Scheduled::Rescheduled(count) => {
                info!("Moved {} reminder(s) for {}", count, appointment.name)
            }
            Scheduled::Enqueued(job_id) => {
                info!("Reminder for {} was already sent, queued {}", appointment.name, job_id)
            }
        }
        Ok(())
    }

    async fn delete(&mut self, id: u64) -> QueueResult<()> {
        if let Some(appointment) = self.rows.remove(&id) {
            let removed = self.queue.cancel(&appointment.owner()).await?;
            info!("Deleted {} and cancelled {} reminder(s)", appointment.name, removed);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    belay_log::init();

    let mut settings = Settings::default();
    settings.apply_env()?;
    settings.worker = settings
        .worker
        .with_queues(["sms"])
        .with_concurrency(2)
        .with_poll_interval(std::time::Duration::from_millis(200));
    settings.validate()?;

    let queue = settings.build_queue().await?;
    queue.clear().await?;

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let mut registry = Registry::new();
    registry.register::<SendReminder>(notifier);

    let mut worker = Worker::with_config(queue.clone(), registry, settings.worker.clone());
    let mut reaper = Reaper::with_config(queue.clone(), settings.reaper.clone());
    worker.start().await?;
    reaper.start().await?;

    let now = Utc::now();
    let mut appointments = Appointments {
        queue: queue.clone(),
        rows: HashMap::new(),
    };

    appointments
        .create(Appointment {
            id: 1,
            name: "Ada".into(),
            phone: "+15550101".into(),
            time: now + Duration::seconds(3),
        })
        .await?;
    appointments
        .create(Appointment {
            id: 2,
            name: "Grace".into(),
            phone: "+15550102".into(),
            time: now + Duration::seconds(4),
        })
        .await?;
    appointments
        .create(Appointment {
            id: 3,
            name: "Edsger".into(),
            phone: "+15550103".into(),
            time: now + Duration::seconds(30),
        })
        .await?;

    appointments.reschedule(2, now + Duration::seconds(6)).await?;
    appointments.delete(3).await?;

    tokio::time::sleep(std::time::Duration::from_secs(6)).await;

    let stats = queue.stats().await?;
    info!(
        "Queue stats - pending: {}, locked: {}, failed: {}",
        stats.pending, stats.locked, stats.failed
    );

    worker.stop().await?;
    reaper.stop().await?;
    Ok(())
}
