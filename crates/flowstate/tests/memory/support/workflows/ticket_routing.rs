//! Ticket routing: open a ticket, route on priority, page on-call for
//! high priority tickets.
//!
//! Paging goes through a [`Pager`] that can be told to fail, so a run fails
//! at `escalate` after the customer was already notified.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use flowstate::{Error, Result, StepHandler, StepOutcome, Workflow, WorkflowInstance};
use serde_json::json;

pub const TYPE: &str = "ticket-routing";

#[derive(Default)]
pub struct Pager {
    failures_left: AtomicUsize,
    pages: AtomicUsize,
    tickets: AtomicUsize,
    notices: AtomicUsize,
}

impl Pager {
    /// A pager whose next `failures` pages fail.
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(failures),
            ..Default::default()
        })
    }

    pub fn pages(&self) -> usize {
        self.pages.load(Ordering::SeqCst)
    }

    pub fn tickets(&self) -> usize {
        self.tickets.load(Ordering::SeqCst)
    }

    pub fn notices(&self) -> usize {
        self.notices.load(Ordering::SeqCst)
    }

    fn open_ticket(&self) -> usize {
        self.tickets.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify_customer(&self) -> usize {
        self.notices.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn page(&self) -> std::result::Result<usize, String> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err("pager unavailable".into());
        }
        Ok(self.pages.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

pub struct TicketRouting {
    pager: Arc<Pager>,
}

#[async_trait]
impl StepHandler for TicketRouting {
    async fn handle(&self, instance: &mut WorkflowInstance) -> Result<StepOutcome> {
        let step = instance.current_step().to_string();
        match step.as_str() {
            "open" => {
                let pager = Arc::clone(&self.pager);
                let ticket = instance
                    .with_action("create-ticket", || async move {
                        Ok::<_, String>(format!("T-{}", pager.open_ticket()))
                    })
                    .await?
                    .into_value();
                instance.state_mut()["ticketId"] = json!(ticket);
                Ok(StepOutcome::advance("route"))
            }
            "route" => {
                let next = if instance.state()["priority"] == "high" {
                    "escalate"
                } else {
                    "queue"
                };
                Ok(StepOutcome::advance(next))
            }
            "escalate" => {
                let pager = Arc::clone(&self.pager);
                instance
                    .with_action("notify-customer", || async move {
                        Ok::<_, String>(pager.notify_customer())
                    })
                    .await?;

                let pager = Arc::clone(&self.pager);
                let page = instance
                    .with_action("page-oncall", || async move { pager.page() })
                    .await?
                    .into_value();
                instance.state_mut()["page"] = json!(page);
                Ok(StepOutcome::Done)
            }
            "queue" => Ok(StepOutcome::Done),
            other => Err(Error::handler(other, "unknown step")),
        }
    }
}

pub fn workflow(pager: Arc<Pager>) -> Workflow {
    let handler: Arc<dyn StepHandler> = Arc::new(TicketRouting { pager });
    ["open", "route", "escalate", "queue"]
        .into_iter()
        .fold(Workflow::builder(TYPE, "open"), |builder, step| {
            builder.shared_step(step, Arc::clone(&handler))
        })
        .build()
        .expect("ticket routing workflow builds")
}
