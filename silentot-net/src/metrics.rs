//! Communication metrics collected from tracing spans.
//!
//! [`CommLayer`] is a [`tracing_subscriber::Layer`] that counts bytes read and
//! written per protocol phase. A phase is a span with
//! `target = "silentot_metrics"` and a `phase` field. The connection emits
//! `bytes_read`/`bytes_written` events with the same target, which are added
//! to the innermost enclosing phase. Nested phases are reported as sub phases
//! of their parent.
//!
//! ```
//! use tracing::{Level, event, instrument};
//!
//! #[instrument(target = "silentot_metrics", fields(phase = "Extend"))]
//! async fn extend() {
//!     event!(target: "silentot_metrics", Level::TRACE, bytes_written = 5);
//!     expand().await
//! }
//!
//! #[instrument(target = "silentot_metrics", fields(phase = "Expand"))]
//! async fn expand() {
//!     // recorded in the sub phase "Expand" of "Extend"
//!     event!(target: "silentot_metrics", Level::TRACE, bytes_written = 10);
//! }
//! ```
use std::{
    collections::{BTreeMap, btree_map::Entry},
    fmt::Debug,
    mem,
    ops::AddAssign,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};
use tracing::{
    Level,
    field::{Field, Visit},
    span::{Attributes, Id},
    warn,
};
use tracing_subscriber::{
    filter::{Filtered, Targets},
    layer::{Context, Layer},
};

const TARGET: &str = "silentot_metrics";

/// Communication of a phase and its sub phases.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct CommData {
    pub phase: String,
    pub read: Counter,
    pub write: Counter,
    pub sub_comm_data: SubCommData,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct Counter {
    /// Bytes written/read directly in this phase.
    pub bytes: u64,
    /// Bytes written/read in this phase and all sub phases.
    pub bytes_with_sub_comm: u64,
}

/// Communication per phase name.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SubCommData(BTreeMap<String, CommData>);

/// A [`CommLayerData`] that only sees spans and events with the
/// `silentot_metrics` target.
pub type CommLayer<S> = Filtered<CommLayerData, Targets, S>;

/// Shared handle to the collected root [`SubCommData`].
#[derive(Clone, Debug, Default)]
pub struct CommLayerData {
    comm_data: Arc<Mutex<SubCommData>>,
}

/// Create a [`CommLayer`] and the handle to read its data.
pub fn new_comm_layer<S>() -> (CommLayer<S>, CommLayerData)
where
    S: tracing::Subscriber,
    S: for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    let inner = CommLayerData::default();
    let target_filter = Targets::new().with_target(TARGET, Level::TRACE);
    (inner.clone().with_filter(target_filter), inner)
}

impl CommLayerData {
    /// Snapshot of the data of all closed top level phases.
    pub fn comm_data(&self) -> SubCommData {
        self.comm_data.lock().expect("lock poisoned").clone()
    }

    /// Take the collected data, leaving it empty.
    ///
    /// Phases still open when this is called are recorded after the reset.
    pub fn reset(&self) -> SubCommData {
        mem::take(&mut *self.comm_data.lock().expect("lock poisoned"))
    }
}

impl<S> Layer<S> for CommLayerData
where
    S: tracing::Subscriber,
    S: for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let span = ctx.span(id).expect("Id is valid");
        let mut visitor = PhaseVisitor(None);
        attrs.record(&mut visitor);
        if let Some(phase) = visitor.0 {
            span.extensions_mut().insert(CommData::new(phase));
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.event_span(event) else {
            warn!("silentot_metrics event outside of a phase span is not tracked");
            return;
        };
        let mut vis = CommEventVisitor::default();
        event.record(&mut vis);
        if vis.read.is_none() && vis.written.is_none() {
            return;
        }
        let mut extensions = span.extensions_mut();
        let Some(comm_data) = extensions.get_mut::<CommData>() else {
            warn!("silentot_metrics span without phase field, communication is not tracked");
            return;
        };
        if let Some(read) = vis.read {
            comm_data.read += read;
        }
        if let Some(written) = vis.written {
            comm_data.write += written;
        }
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        let span = ctx.span(&id).expect("Id is valid");
        let Some(comm_data) = span.extensions_mut().get_mut::<CommData>().map(mem::take) else {
            return;
        };

        let parent = span
            .scope()
            .skip(1)
            .find(|s| s.extensions().get::<CommData>().is_some());
        match parent {
            Some(parent) => {
                let mut extensions = parent.extensions_mut();
                let parent_data = extensions
                    .get_mut::<CommData>()
                    .expect("checked for CommData");
                parent_data.read.bytes_with_sub_comm += comm_data.read.bytes_with_sub_comm;
                parent_data.write.bytes_with_sub_comm += comm_data.write.bytes_with_sub_comm;
                parent_data.sub_comm_data.insert(comm_data);
            }
            None => {
                self.comm_data
                    .lock()
                    .expect("lock poisoned")
                    .insert(comm_data);
            }
        }
    }
}

impl SubCommData {
    /// Get the [`CommData`] of a phase.
    pub fn get(&self, phase: &str) -> Option<&CommData> {
        self.0.get(phase)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommData> {
        self.0.values()
    }

    // Phases with equal names are merged, e.g. when a phase runs repeatedly.
    fn insert(&mut self, data: CommData) {
        match self.0.entry(data.phase.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(data);
            }
            Entry::Occupied(mut entry) => {
                let into = entry.get_mut();
                into.read += data.read;
                into.write += data.write;
                for sub in data.sub_comm_data.0.into_values() {
                    into.sub_comm_data.insert(sub);
                }
            }
        }
    }
}

impl AddAssign for Counter {
    fn add_assign(&mut self, rhs: Self) {
        self.bytes += rhs.bytes;
        self.bytes_with_sub_comm += rhs.bytes_with_sub_comm;
    }
}

impl AddAssign<u64> for Counter {
    fn add_assign(&mut self, rhs: u64) {
        self.bytes += rhs;
        self.bytes_with_sub_comm += rhs;
    }
}

impl CommData {
    fn new(phase: String) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }
}

struct PhaseVisitor(Option<String>);

impl Visit for PhaseVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "phase" {
            self.0 = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if field.name() == "phase" {
            self.0 = Some(format!("{value:?}"));
        }
    }
}

#[derive(Default)]
struct CommEventVisitor {
    read: Option<u64>,
    written: Option<u64>,
}

impl CommEventVisitor {
    fn record(&mut self, field: &Field, value: Option<u64>) {
        let slot = match field.name() {
            "bytes_read" => &mut self.read,
            "bytes_written" => &mut self.written,
            _ => return,
        };
        match value {
            Some(value) => *slot = Some(value),
            None => warn!(field = field.name(), "byte count does not fit into u64"),
        }
    }
}

impl Visit for CommEventVisitor {
    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record(field, value.try_into().ok());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record(field, Some(value));
    }

    fn record_i128(&mut self, field: &Field, value: i128) {
        self.record(field, value.try_into().ok());
    }

    fn record_u128(&mut self, field: &Field, value: u128) {
        self.record(field, value.try_into().ok());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        if matches!(field.name(), "bytes_read" | "bytes_written") {
            warn!("non-integer silentot_metrics field {}: {:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tracing::{Instrument, Level, event, instrument};
    use tracing_subscriber::{Registry, layer::SubscriberExt};

    use crate::{metrics::new_comm_layer, testing::local_conn};

    #[tokio::test]
    async fn nested_phases() {
        #[instrument(target = "silentot_metrics", fields(phase = "Outer"))]
        async fn outer() {
            event!(target: "silentot_metrics", Level::TRACE, bytes_read = 100);
            event!(target: "silentot_metrics", Level::TRACE, bytes_written = 200);
            inner().await;
            inner().await;
        }

        #[instrument(target = "silentot_metrics", fields(phase = "Inner"))]
        async fn inner() {
            event!(target: "silentot_metrics", Level::TRACE, bytes_read = 50);
            event!(target: "silentot_metrics", Level::TRACE, bytes_written = 100);
        }

        let (comm_layer, comm_data) = new_comm_layer();
        let subscriber = Registry::default().with(comm_layer);
        let _guard = tracing::subscriber::set_default(subscriber);
        outer().await;

        let metrics = comm_data.comm_data();
        let outer = metrics.get("Outer").expect("Outer phase");
        assert_eq!(100, outer.read.bytes);
        assert_eq!(200, outer.write.bytes);
        assert_eq!(200, outer.read.bytes_with_sub_comm);
        assert_eq!(400, outer.write.bytes_with_sub_comm);
        let inner = outer.sub_comm_data.get("Inner").expect("Inner phase");
        assert_eq!(100, inner.read.bytes);
        assert_eq!(200, inner.write.bytes);

        assert!(comm_data.reset().get("Outer").is_some());
        assert!(comm_data.comm_data().get("Outer").is_none());
    }

    #[tokio::test]
    async fn spawned_sub_phase() {
        #[instrument(target = "silentot_metrics", fields(phase = "Parent"))]
        async fn parent() {
            // spawned tasks must be instrumented to keep the hierarchy
            tokio::spawn(child().in_current_span())
                .await
                .expect("child panicked");
        }

        #[instrument(target = "silentot_metrics", fields(phase = "Child"))]
        async fn child() {
            event!(target: "silentot_metrics", Level::TRACE, bytes_written = 100);
        }

        let (comm_layer, comm_data) = new_comm_layer();
        let subscriber = Registry::default().with(comm_layer);
        let _guard = tracing::subscriber::set_default(subscriber);
        tokio::join!(parent(), parent());

        let metrics = comm_data.comm_data();
        let parent = metrics.get("Parent").expect("Parent phase");
        assert_eq!(200, parent.write.bytes_with_sub_comm);
        assert_eq!(200, parent.sub_comm_data.get("Child").expect("Child").write.bytes);
    }

    #[tokio::test]
    async fn connection_bytes_are_counted() -> anyhow::Result<()> {
        let (comm_layer, comm_data) = new_comm_layer();
        let subscriber = Registry::default().with(comm_layer);
        let _guard = tracing::subscriber::set_default(subscriber);

        let (mut c1, mut c2) = local_conn().await?;
        let phase = tracing::trace_span!(target: "silentot_metrics", "send", phase = "Send");
        async {
            let (mut snd, _) = c1.stream::<Vec<u8>>().await?;
            snd.send(vec![0; 1000]).await?;
            anyhow::Ok(())
        }
        .instrument(phase)
        .await?;
        let (_, mut recv) = c2.stream::<Vec<u8>>().await?;
        recv.next().await.expect("message")?;

        let metrics = comm_data.comm_data();
        assert!(metrics.get("Send").expect("Send phase").write.bytes >= 1000);
        Ok(())
    }
}
