// End-to-end scenarios exercising the pipeline core: ordering, queue
// policies, throttling, closing semantics and deterministic replay.

use std::{
  sync::{Arc, Mutex},
  thread,
  time::Duration as StdDuration,
};

use chronopipe::{
  sync::ManualResetEvent, DeliveryPolicy, Duration, Envelope, Pipeline, PipelineError,
  PipelineOptions, ReplayDescriptor, SourceComponent, Time, TimeInterval,
};

fn t(ticks: i64) -> Time {
  Time::from_ticks(ticks)
}

/// As-fast-as-possible execution with the virtual clock frozen at `origin`.
fn afap(origin: i64) -> ReplayDescriptor {
  ReplayDescriptor {
    interval: TimeInterval::starting_at(t(origin)),
    use_originating_time: true,
    enforce_replay_clock: false,
  }
}

type Log = Arc<Mutex<Vec<(i64, i64)>>>;

// ----------------------------------------------------------------------------

#[test_log::test]
fn two_stage_pipeline_preserves_order() {
  let pipeline = Pipeline::new(PipelineOptions::default());
  let source = pipeline.add_element("source");
  let doubler = pipeline.add_element("doubler");
  let sink = pipeline.add_element("sink");

  let a_out = pipeline.create_emitter::<i64>(&source, "a.out");
  let b_out = pipeline.create_emitter::<i64>(&doubler, "b.out");

  let forward = Arc::clone(&b_out);
  let doubler_in = pipeline.create_receiver(&doubler, "doubler.in", move |v: &i64, e: &Envelope| {
    forward.post(v * 2, e.originating_time)
  });

  let log: Log = Arc::new(Mutex::new(Vec::new()));
  let sink_log = Arc::clone(&log);
  let sink_in = pipeline.create_receiver(&sink, "sink.in", move |v: &i64, e: &Envelope| {
    sink_log.lock().unwrap().push((*v, e.originating_time.ticks()));
    Ok(())
  });

  a_out
    .subscribe(&doubler_in, DeliveryPolicy::unlimited(), false)
    .unwrap();
  b_out
    .subscribe(&sink_in, DeliveryPolicy::unlimited(), false)
    .unwrap();

  pipeline.start(afap(0)).unwrap();
  a_out.post(1, t(10)).unwrap();
  a_out.post(2, t(20)).unwrap();
  a_out.post(3, t(30)).unwrap();
  pipeline.stop(false);

  assert_eq!(*log.lock().unwrap(), vec![(2, 10), (4, 20), (6, 30)]);
}

#[test_log::test]
fn queue_overflow_without_guarantees_keeps_latest() {
  let pipeline = Pipeline::new(PipelineOptions::default());
  let source = pipeline.add_element("source");
  let sink = pipeline.add_element("sink");
  let out = pipeline.create_emitter::<i64>(&source, "out");

  let log: Log = Arc::new(Mutex::new(Vec::new()));
  let consumer_busy = Arc::new(ManualResetEvent::new(false));
  let sink_log = Arc::clone(&log);
  let busy = Arc::clone(&consumer_busy);
  let input = pipeline.create_receiver(&sink, "in", move |v: &i64, e: &Envelope| {
    if *v == 0 {
      // The "slow consumer": holds the component lock while the burst
      // below overflows the queue.
      busy.set();
      thread::sleep(StdDuration::from_millis(300));
      return Ok(());
    }
    sink_log.lock().unwrap().push((*v, e.originating_time.ticks()));
    Ok(())
  });

  let mut policy = DeliveryPolicy::unlimited().with_maximum_queue_size(2);
  policy.attempt_synchronous_delivery = false;
  out.subscribe(&input, policy, false).unwrap();

  pipeline.start(afap(0)).unwrap();
  out.post(0, t(5)).unwrap();
  consumer_busy.wait();
  for i in 1..=5 {
    out.post(i, t(10 * i)).unwrap();
  }
  pipeline.stop(false);

  assert_eq!(*log.lock().unwrap(), vec![(4, 40), (5, 50)]);
  assert_eq!(input.dropped_count(), 3);
}

#[test_log::test]
fn latency_constraint_delivers_only_fresh_tail() {
  let pipeline = Pipeline::new(PipelineOptions::default());
  let source = pipeline.add_element("source");
  let sink = pipeline.add_element("sink");
  let out = pipeline.create_emitter::<i64>(&source, "out");

  let log: Log = Arc::new(Mutex::new(Vec::new()));
  let consumer_busy = Arc::new(ManualResetEvent::new(false));
  let sink_log = Arc::clone(&log);
  let busy = Arc::clone(&consumer_busy);
  let input = pipeline.create_receiver(&sink, "in", move |v: &i64, e: &Envelope| {
    if *v == 0 {
      busy.set();
      thread::sleep(StdDuration::from_millis(500));
      return Ok(());
    }
    sink_log.lock().unwrap().push((*v, e.originating_time.ticks()));
    Ok(())
  });

  // Virtual "now" is frozen at 1000; messages older than 5 ticks at
  // delivery time are dropped. The primer is guaranteed so it survives to
  // keep the consumer busy.
  let mut policy =
    DeliveryPolicy::latency_constrained(Duration::from_ticks(5)).with_guarantee_delivery(|v: &i64| *v == 0);
  policy.attempt_synchronous_delivery = false;
  out.subscribe(&input, policy, false).unwrap();

  pipeline.start(afap(1000)).unwrap();
  out.post(0, t(0)).unwrap();
  consumer_busy.wait();
  for i in 1..=1000 {
    out.post(i, t(i)).unwrap();
  }
  pipeline.stop(false);

  let delivered = log.lock().unwrap().clone();
  let expected: Vec<(i64, i64)> = (995..=1000).map(|i| (i, i)).collect();
  assert_eq!(delivered, expected);
  assert_eq!(input.dropped_count(), 994);
}

#[test_log::test]
fn throttling_backpressures_emitter_without_drops() {
  const COUNT: i64 = 500;

  let pipeline = Pipeline::new(PipelineOptions::default());
  let source = pipeline.add_element("source");
  let sink = pipeline.add_element("sink");
  let out = pipeline.create_emitter::<i64>(&source, "out");

  let log: Log = Arc::new(Mutex::new(Vec::new()));
  let sink_log = Arc::clone(&log);
  let input = pipeline.create_receiver(&sink, "in", move |v: &i64, e: &Envelope| {
    sink_log.lock().unwrap().push((*v, e.originating_time.ticks()));
    // Slow consumer: the queue builds, crosses the throttle threshold and
    // freezes the emitter until it drains again.
    thread::sleep(StdDuration::from_micros(200));
    Ok(())
  });

  let policy = DeliveryPolicy::throttle()
    .with_throttle_queue_size(3)
    .with_maximum_queue_size(100);
  out.subscribe(&input, policy, false).unwrap();

  pipeline.start(afap(0)).unwrap();
  // Tight posting loop; the poster is never blocked, its deliveries only
  // queue behind the frozen emitter lock while throttled.
  for i in 1..=COUNT {
    out.post(i, t(10 + i)).unwrap();
  }
  pipeline.stop(false);

  let delivered = log.lock().unwrap().clone();
  let expected: Vec<(i64, i64)> = (1..=COUNT).map(|i| (i, 10 + i)).collect();
  assert_eq!(delivered, expected);
  assert_eq!(input.dropped_count(), 0);
}

#[test_log::test]
fn closing_semantics() {
  let pipeline = Pipeline::new(PipelineOptions::default());
  let source = pipeline.add_element("source");
  let sink = pipeline.add_element("sink");
  let out = pipeline.create_emitter::<i64>(&source, "out");

  let log: Log = Arc::new(Mutex::new(Vec::new()));
  let sink_log = Arc::clone(&log);
  let input = pipeline.create_receiver(&sink, "in", move |v: &i64, e: &Envelope| {
    sink_log.lock().unwrap().push((*v, e.originating_time.ticks()));
    Ok(())
  });
  let final_times = Arc::new(Mutex::new(Vec::new()));
  let observed = Arc::clone(&final_times);
  input.on_unsubscribed(move |final_time| {
    observed.lock().unwrap().push(final_time.ticks());
  });

  out
    .subscribe(&input, DeliveryPolicy::unlimited(), false)
    .unwrap();

  pipeline.start(afap(0)).unwrap();
  out.post(1, t(10)).unwrap();
  out.close(t(20)).unwrap();
  // Post after close is a no-op, not an error.
  out.post(2, t(30)).unwrap();
  pipeline.stop(false);

  assert_eq!(*log.lock().unwrap(), vec![(1, 10)]);
  assert_eq!(*final_times.lock().unwrap(), vec![20]);
  assert!(out.is_closed());
  assert_eq!(out.subscriber_count(), 0);
  assert!(!input.has_source());
}

#[test_log::test]
fn replay_is_deterministic() {
  fn run_once() -> Vec<(i64, i64, i32)> {
    let pipeline = Pipeline::new(PipelineOptions::default());
    let source = pipeline.add_element("source");
    let doubler = pipeline.add_element("doubler");
    let sink = pipeline.add_element("sink");
    let a_out = pipeline.create_emitter::<i64>(&source, "a.out");
    let b_out = pipeline.create_emitter::<i64>(&doubler, "b.out");

    let forward = Arc::clone(&b_out);
    let doubler_in =
      pipeline.create_receiver(&doubler, "doubler.in", move |v: &i64, e: &Envelope| {
        forward.post(v * 2, e.originating_time)
      });
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink_log = Arc::clone(&log);
    let sink_in = pipeline.create_receiver(&sink, "sink.in", move |v: &i64, e: &Envelope| {
      sink_log
        .lock()
        .unwrap()
        .push((*v, e.originating_time.ticks(), e.sequence_id));
      Ok(())
    });
    a_out
      .subscribe(&doubler_in, DeliveryPolicy::unlimited(), false)
      .unwrap();
    b_out
      .subscribe(&sink_in, DeliveryPolicy::unlimited(), false)
      .unwrap();

    pipeline.start(afap(0)).unwrap();
    for i in 1..=50 {
      a_out.post(i, t(i * 10)).unwrap();
    }
    pipeline.stop(false);
    let result = log.lock().unwrap().clone();
    result
  }

  let first = run_once();
  let second = run_once();
  assert_eq!(first.len(), 50);
  assert_eq!(first, second);
}

// ----------------------------------------------------------------------------
// Lifecycle, subscription and error handling

#[test_log::test]
fn subscribe_unsubscribe_round_trip() {
  let pipeline = Pipeline::new(PipelineOptions::default());
  let source = pipeline.add_element("source");
  let sink = pipeline.add_element("sink");
  let out = pipeline.create_emitter::<i64>(&source, "out");
  let input = pipeline.create_receiver(&sink, "in", |_: &i64, _: &Envelope| Ok(()));

  assert_eq!(out.subscriber_count(), 0);
  out
    .subscribe(&input, DeliveryPolicy::unlimited(), false)
    .unwrap();
  assert_eq!(out.subscriber_count(), 1);
  assert!(input.has_source());

  out.unsubscribe(&input);
  assert_eq!(out.subscriber_count(), 0);
  assert!(!input.has_source());
  out.unsubscribe(&input); // idempotent
  assert_eq!(out.subscriber_count(), 0);

  // The receiver can be subscribed again after unsubscription.
  out
    .subscribe(&input, DeliveryPolicy::unlimited(), false)
    .unwrap();
  assert_eq!(out.subscriber_count(), 1);
}

#[test_log::test]
fn cross_pipeline_subscription_is_rejected() {
  let p1 = Pipeline::new(PipelineOptions::default());
  let p2 = Pipeline::new(PipelineOptions::default());
  let source = p1.add_element("source");
  let sink = p2.add_element("sink");
  let out = p1.create_emitter::<i64>(&source, "out");
  let input = p2.create_receiver(&sink, "in", |_: &i64, _: &Envelope| Ok(()));

  let result = out.subscribe(&input, DeliveryPolicy::unlimited(), false);
  assert!(matches!(
    result,
    Err(PipelineError::CrossPipelineSubscription { .. })
  ));
}

#[test_log::test]
fn late_subscription_requires_opt_in() {
  let pipeline = Pipeline::new(PipelineOptions::default());
  let source = pipeline.add_element("source");
  let sink = pipeline.add_element("sink");
  let out = pipeline.create_emitter::<i64>(&source, "out");
  let input = pipeline.create_receiver(&sink, "in", |_: &i64, _: &Envelope| Ok(()));

  pipeline.start(afap(0)).unwrap();
  let result = out.subscribe(&input, DeliveryPolicy::unlimited(), false);
  assert!(matches!(
    result,
    Err(PipelineError::SubscribeWhileRunning { .. })
  ));
  // Explicit opt-in allows the late join.
  out
    .subscribe(&input, DeliveryPolicy::unlimited(), true)
    .unwrap();
  pipeline.stop(false);
}

#[test_log::test]
fn non_monotonic_post_is_an_invalid_sequence() {
  let pipeline = Pipeline::new(PipelineOptions::default());
  let source = pipeline.add_element("source");
  let out = pipeline.create_emitter::<i64>(&source, "out");

  pipeline.start(afap(0)).unwrap();
  out.post(1, t(20)).unwrap();
  let result = out.post(2, t(10));
  assert!(matches!(result, Err(PipelineError::InvalidSequence { .. })));
  // Equal originating times are rejected too.
  let result = out.post(2, t(20));
  assert!(matches!(result, Err(PipelineError::InvalidSequence { .. })));
  pipeline.stop(false);
}

#[test_log::test]
fn stop_is_idempotent() {
  let pipeline = Pipeline::new(PipelineOptions::default());
  let source = pipeline.add_element("source");
  let out = pipeline.create_emitter::<i64>(&source, "out");
  pipeline.start(afap(0)).unwrap();
  out.post(1, t(10)).unwrap();
  pipeline.stop(false);
  pipeline.stop(false);
  pipeline.stop(true);
  assert!(matches!(
    pipeline.start(afap(0)),
    Err(PipelineError::AlreadyRunning { .. })
  ));
}

// A scripted source: posts a fixed script from its own thread, then
// reports the originating time of its last message.
struct ScriptedSource {
  emitter: Arc<chronopipe::Emitter<i64>>,
  script: Vec<(i64, i64)>,
  worker: Option<thread::JoinHandle<()>>,
}

impl SourceComponent for ScriptedSource {
  fn start(
    &mut self,
    notify_completion_time: Box<dyn FnOnce(Time) + Send>,
  ) -> Result<(), PipelineError> {
    let emitter = Arc::clone(&self.emitter);
    let script = self.script.clone();
    self.worker = Some(thread::spawn(move || {
      let mut last = Time::UNIX_EPOCH;
      for (value, ticks) in script {
        let time = Time::from_ticks(ticks);
        emitter.post(value, time).expect("scripted post");
        last = time;
      }
      notify_completion_time(last);
    }));
    Ok(())
  }

  fn stop(
    &mut self,
    _final_originating_time: Time,
    notify_completed: Box<dyn FnOnce() + Send>,
  ) -> Result<(), PipelineError> {
    if let Some(worker) = self.worker.take() {
      let _ = worker.join();
    }
    notify_completed();
    Ok(())
  }
}

#[test_log::test]
fn run_completes_when_finite_sources_finish() {
  let pipeline = Pipeline::new(PipelineOptions::default());
  let source = pipeline.add_element("source");
  let sink = pipeline.add_element("sink");
  let out = pipeline.create_emitter::<i64>(&source, "out");

  let log: Log = Arc::new(Mutex::new(Vec::new()));
  let sink_log = Arc::clone(&log);
  let input = pipeline.create_receiver(&sink, "in", move |v: &i64, e: &Envelope| {
    sink_log.lock().unwrap().push((*v, e.originating_time.ticks()));
    Ok(())
  });
  out
    .subscribe(&input, DeliveryPolicy::unlimited(), false)
    .unwrap();

  let script: Vec<(i64, i64)> = (1..=20).map(|i| (i, i * 5)).collect();
  pipeline.attach_source(
    &source,
    ScriptedSource {
      emitter: Arc::clone(&out),
      script: script.clone(),
      worker: None,
    },
  );

  pipeline.run(afap(0)).unwrap();

  let delivered = log.lock().unwrap().clone();
  let expected: Vec<(i64, i64)> = script;
  assert_eq!(delivered, expected);

  // After a successful run nothing is left in flight.
  let diagnostics = pipeline.diagnostics();
  assert_eq!(diagnostics.scheduler.ready_queue_len, 0);
  assert_eq!(diagnostics.scheduler.future_queue_len, 0);
  for receiver in &diagnostics.receivers {
    assert_eq!(receiver.queued, 0);
  }
}

#[test_log::test]
fn unrecovered_callback_error_forces_shutdown() {
  let pipeline = Pipeline::new(PipelineOptions::default());
  let source = pipeline.add_element("source");
  let sink = pipeline.add_element("sink");
  let out = pipeline.create_emitter::<i64>(&source, "out");
  let input = pipeline.create_receiver(&sink, "in", |_: &i64, _: &Envelope| {
    Err(PipelineError::callback("sink cannot cope"))
  });
  out
    .subscribe(&input, DeliveryPolicy::unlimited(), false)
    .unwrap();
  pipeline.attach_source(
    &source,
    ScriptedSource {
      emitter: Arc::clone(&out),
      script: vec![(1, 10), (2, 20)],
      worker: None,
    },
  );

  let result = pipeline.run(afap(0));
  assert!(matches!(
    result,
    Err(PipelineError::ForcedShutdown { .. })
  ));
}

#[test_log::test]
fn handled_callback_error_keeps_the_pipeline_alive() {
  let options = PipelineOptions {
    error_handler: Some(Arc::new(|_e: &PipelineError| true)),
    ..PipelineOptions::default()
  };
  let pipeline = Pipeline::new(options);
  let source = pipeline.add_element("source");
  let sink = pipeline.add_element("sink");
  let out = pipeline.create_emitter::<i64>(&source, "out");

  let log: Log = Arc::new(Mutex::new(Vec::new()));
  let sink_log = Arc::clone(&log);
  let input = pipeline.create_receiver(&sink, "in", move |v: &i64, e: &Envelope| {
    if *v % 2 == 0 {
      return Err(PipelineError::callback("even values rejected"));
    }
    sink_log.lock().unwrap().push((*v, e.originating_time.ticks()));
    Ok(())
  });
  out
    .subscribe(&input, DeliveryPolicy::unlimited(), false)
    .unwrap();
  pipeline.attach_source(
    &source,
    ScriptedSource {
      emitter: Arc::clone(&out),
      script: (1..=6).map(|i| (i, i * 10)).collect(),
      worker: None,
    },
  );

  pipeline.run(afap(0)).unwrap();
  assert_eq!(*log.lock().unwrap(), vec![(1, 10), (3, 30), (5, 50)]);
}

#[test_log::test]
fn latest_message_policy_delivers_only_the_newest() {
  let pipeline = Pipeline::new(PipelineOptions::default());
  let source = pipeline.add_element("source");
  let sink = pipeline.add_element("sink");
  let out = pipeline.create_emitter::<i64>(&source, "out");

  let log: Log = Arc::new(Mutex::new(Vec::new()));
  let consumer_busy = Arc::new(ManualResetEvent::new(false));
  let sink_log = Arc::clone(&log);
  let busy = Arc::clone(&consumer_busy);
  let input = pipeline.create_receiver(&sink, "in", move |v: &i64, e: &Envelope| {
    if *v == 0 {
      busy.set();
      thread::sleep(StdDuration::from_millis(200));
      return Ok(());
    }
    sink_log.lock().unwrap().push((*v, e.originating_time.ticks()));
    Ok(())
  });

  let mut policy = DeliveryPolicy::latest_message();
  policy.attempt_synchronous_delivery = false;
  out.subscribe(&input, policy, false).unwrap();

  pipeline.start(afap(0)).unwrap();
  out.post(0, t(1)).unwrap();
  consumer_busy.wait();
  for i in 1..=10 {
    out.post(i, t(10 + i)).unwrap();
  }
  pipeline.stop(false);

  assert_eq!(*log.lock().unwrap(), vec![(10, 20)]);
}

#[test_log::test]
fn subpipeline_stops_independently_of_parent() {
  let parent = Pipeline::new(PipelineOptions::default());
  let child = parent.create_subpipeline("child");

  let parent_el = parent.add_element("parent-sink");
  let child_el = child.add_element("child-sink");
  let parent_src = parent.add_element("parent-src");
  let child_src = child.add_element("child-src");

  let parent_out = parent.create_emitter::<i64>(&parent_src, "out");
  let child_out = child.create_emitter::<i64>(&child_src, "out");

  let parent_log: Log = Arc::new(Mutex::new(Vec::new()));
  let child_log: Log = Arc::new(Mutex::new(Vec::new()));
  let pl = Arc::clone(&parent_log);
  let parent_in = parent.create_receiver(&parent_el, "in", move |v: &i64, e: &Envelope| {
    pl.lock().unwrap().push((*v, e.originating_time.ticks()));
    Ok(())
  });
  let cl = Arc::clone(&child_log);
  let child_in = child.create_receiver(&child_el, "in", move |v: &i64, e: &Envelope| {
    cl.lock().unwrap().push((*v, e.originating_time.ticks()));
    Ok(())
  });
  parent_out
    .subscribe(&parent_in, DeliveryPolicy::unlimited(), false)
    .unwrap();
  child_out
    .subscribe(&child_in, DeliveryPolicy::unlimited(), false)
    .unwrap();

  // Streams cannot cross the pipeline boundary, even parent <-> child.
  let crossed = parent_out.subscribe(&child_in, DeliveryPolicy::unlimited(), false);
  assert!(matches!(
    crossed,
    Err(PipelineError::CrossPipelineSubscription { .. })
  ));

  parent.start(afap(0)).unwrap();
  child.start(afap(0)).unwrap();

  parent_out.post(1, t(10)).unwrap();
  child_out.post(100, t(10)).unwrap();
  child.stop(false);

  // The parent keeps flowing after the child stopped.
  parent_out.post(2, t(20)).unwrap();
  parent.stop(false);

  assert_eq!(*child_log.lock().unwrap(), vec![(100, 10)]);
  assert_eq!(*parent_log.lock().unwrap(), vec![(1, 10), (2, 20)]);
}
