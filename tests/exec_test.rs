// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use arrow::array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};

use cascade::common::error::EngineError;
use cascade::exec::batch::Batch;
use cascade::exec::expr::Expr;
use cascade::exec::node::aggregate::{Aggregate, AggregateNodeOptions};
use cascade::exec::node::filter::FilterNodeOptions;
use cascade::exec::node::hash_join::HashJoinNodeOptions;
use cascade::exec::node::order_by::{OrderByNodeOptions, SortKey};
use cascade::exec::node::project::ProjectNodeOptions;
use cascade::exec::node::registry::NodeOptions;
use cascade::exec::node::sink::{
    BackpressureOptions, ConsumingSinkNodeOptions, SinkConsumer, SinkNode, SinkNodeOptions,
};
use cascade::exec::node::source::SourceNodeOptions;
use cascade::exec::node::{ExecNode, NodeId};
use cascade::exec::plan::{ExecContext, ExecPlan, PlanState};
use cascade::runtime::async_generator::{iter_generator, vec_generator, AsyncGenerator};
use cascade::runtime::thread_pool::{SerialExecutor, ThreadPool};

// Pin the output chunk size low so chunked emission is observable with
// small inputs. Loaded once per test binary, before any plan is built.
fn init_test_config() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cascade.toml");
        std::fs::write(&path, "[runtime]\naggregate_output_chunk_rows = 4\n")
            .expect("write config");
        cascade::cascade_config::init_from_path(&path).expect("load config");
        std::mem::forget(dir);
    });
}

fn int64_schema(name: &str) -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new(name, DataType::Int64, false)]))
}

fn int64_batch(name: &str, values: &[i64]) -> Batch {
    let array = Arc::new(Int64Array::from(values.to_vec())) as ArrayRef;
    Batch::new(RecordBatch::try_new(int64_schema(name), vec![array]).expect("record batch"))
}

fn keyed_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("k", DataType::Utf8, false),
        Field::new("v", DataType::Int64, false),
    ]))
}

fn keyed_batch(keys: &[&str], values: &[i64]) -> Batch {
    let key_array = Arc::new(StringArray::from(keys.to_vec())) as ArrayRef;
    let value_array = Arc::new(Int64Array::from(values.to_vec())) as ArrayRef;
    Batch::new(
        RecordBatch::try_new(keyed_schema(), vec![key_array, value_array]).expect("record batch"),
    )
}

fn test_context() -> (ExecContext, Arc<ThreadPool>) {
    let pool = ThreadPool::new(4);
    (ExecContext::with_executor(pool.clone()), pool)
}

fn sink_generator(plan: &Arc<ExecPlan>, sink: NodeId) -> AsyncGenerator {
    plan.node(sink)
        .expect("sink node")
        .as_any()
        .downcast_ref::<SinkNode>()
        .expect("sink downcast")
        .generator()
}

fn drain(generator: &AsyncGenerator) -> Result<Vec<Batch>, EngineError> {
    let mut batches = Vec::new();
    loop {
        match generator().wait()? {
            Some(batch) => batches.push(batch),
            None => return Ok(batches),
        }
    }
}

fn int64_values(batches: &[Batch], column: usize) -> Vec<i64> {
    let mut values = Vec::new();
    for batch in batches {
        let array = batch
            .column(column)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("i64 column");
        values.extend(array.iter().map(|v| v.expect("non-null")));
    }
    values
}

fn sum_aggregate(target: usize) -> AggregateNodeOptions {
    AggregateNodeOptions {
        aggregates: vec![Aggregate {
            function: "sum".to_string(),
            target,
            output_name: "sum".to_string(),
        }],
        keys: vec![],
    }
}

/// Source(batches) -> ScalarAggregate(sum) -> Sink.
fn sum_plan(batches: Vec<Batch>) -> (Arc<ExecPlan>, NodeId, Arc<ThreadPool>) {
    let (ctx, pool) = test_context();
    let plan = ExecPlan::new(ctx);
    let source = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("x"),
                generator: vec_generator(batches),
            }),
        )
        .expect("source");
    let aggregate = plan
        .add_node(
            "aggregate",
            &[source],
            NodeOptions::Aggregate(sum_aggregate(0)),
        )
        .expect("aggregate");
    let sink = plan
        .add_node(
            "sink",
            &[aggregate],
            NodeOptions::Sink(SinkNodeOptions::default()),
        )
        .expect("sink");
    (plan, sink, pool)
}

#[test]
fn scalar_sum_pipeline_emits_one_row() {
    init_test_config();
    let (plan, sink, pool) = sum_plan(vec![int64_batch("x", &[1, 2]), int64_batch("x", &[3])]);
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    plan.finished().wait().expect("finished");
    let generator = sink_generator(&plan, sink);
    let batches = drain(&generator).expect("drain");
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].len(), 1);
    assert_eq!(int64_values(&batches, 0), vec![6]);
    assert_eq!(plan.state(), PlanState::Finished);
    pool.shutdown(true);
}

#[test]
fn scalar_sum_is_partition_independent() {
    init_test_config();
    let partitions: Vec<Vec<Vec<i64>>> = vec![
        vec![(1..=10).collect()],
        vec![vec![1, 2], vec![3, 4], vec![5, 6], vec![7, 8], vec![9, 10]],
        (1..=10).map(|v| vec![v]).collect(),
    ];
    for partition in partitions {
        let batches = partition
            .iter()
            .map(|values| int64_batch("x", values))
            .collect();
        let (plan, sink, pool) = sum_plan(batches);
        plan.validate().expect("validate");
        plan.start_producing().expect("start");
        plan.finished().wait().expect("finished");
        let generator = sink_generator(&plan, sink);
        let batches = drain(&generator).expect("drain");
        assert_eq!(int64_values(&batches, 0), vec![55]);
        pool.shutdown(true);
    }
}

#[test]
fn output_schema_is_stable_across_start() {
    init_test_config();
    let (plan, _sink, pool) = sum_plan(vec![int64_batch("x", &[1])]);
    let schemas_before: Vec<SchemaRef> = (0..plan.num_nodes())
        .map(|id| plan.node(id).expect("node").output_schema())
        .collect();
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    plan.finished().wait().expect("finished");
    for (id, before) in schemas_before.iter().enumerate() {
        assert_eq!(plan.node(id).expect("node").output_schema(), *before);
    }
    pool.shutdown(true);
}

#[test]
fn group_by_produces_one_row_per_key() {
    init_test_config();
    let (ctx, pool) = test_context();
    let plan = ExecPlan::new(ctx);
    let source = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: keyed_schema(),
                generator: vec_generator(vec![
                    keyed_batch(&["a", "b"], &[1, 2]),
                    keyed_batch(&["a"], &[3]),
                ]),
            }),
        )
        .expect("source");
    let aggregate = plan
        .add_node(
            "aggregate",
            &[source],
            NodeOptions::Aggregate(AggregateNodeOptions {
                aggregates: vec![Aggregate {
                    function: "sum".to_string(),
                    target: 1,
                    output_name: "sum_v".to_string(),
                }],
                keys: vec![0],
            }),
        )
        .expect("aggregate");
    // Aggregates precede keys in the output column order.
    let schema = plan.node(aggregate).expect("node").output_schema();
    assert_eq!(schema.field(0).name(), "sum_v");
    assert_eq!(schema.field(1).name(), "k");
    let sink = plan
        .add_node(
            "sink",
            &[aggregate],
            NodeOptions::Sink(SinkNodeOptions::default()),
        )
        .expect("sink");
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    plan.finished().wait().expect("finished");
    let generator = sink_generator(&plan, sink);
    let batches = drain(&generator).expect("drain");
    let mut rows: HashMap<String, i64> = HashMap::new();
    for batch in &batches {
        let sums = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .expect("sum column");
        let keys = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .expect("key column");
        for i in 0..batch.len() {
            rows.insert(keys.value(i).to_string(), sums.value(i));
        }
    }
    let expected: HashMap<String, i64> = [("a".to_string(), 4), ("b".to_string(), 2)]
        .into_iter()
        .collect();
    assert_eq!(rows, expected);
    pool.shutdown(true);
}

#[test]
fn group_by_chunks_large_outputs() {
    init_test_config();
    let (ctx, pool) = test_context();
    let plan = ExecPlan::new(ctx);
    // Ten distinct keys against the four-row chunk limit: three chunks.
    let keys: Vec<String> = (0..10).map(|i| format!("k{i}")).collect();
    let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let values: Vec<i64> = (0..10).collect();
    let source = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: keyed_schema(),
                generator: vec_generator(vec![keyed_batch(&key_refs, &values)]),
            }),
        )
        .expect("source");
    let aggregate = plan
        .add_node(
            "aggregate",
            &[source],
            NodeOptions::Aggregate(AggregateNodeOptions {
                aggregates: vec![Aggregate {
                    function: "sum".to_string(),
                    target: 1,
                    output_name: "sum_v".to_string(),
                }],
                keys: vec![0],
            }),
        )
        .expect("aggregate");
    let sink = plan
        .add_node(
            "sink",
            &[aggregate],
            NodeOptions::Sink(SinkNodeOptions::default()),
        )
        .expect("sink");
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    plan.finished().wait().expect("finished");
    let generator = sink_generator(&plan, sink);
    let batches = drain(&generator).expect("drain");
    assert_eq!(batches.len(), 3);
    assert_eq!(batches.iter().map(Batch::len).sum::<usize>(), 10);
    pool.shutdown(true);
}

struct CountingConsumer {
    batches: AtomicUsize,
    rows: AtomicUsize,
    finishes: AtomicUsize,
}

impl CountingConsumer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: AtomicUsize::new(0),
            rows: AtomicUsize::new(0),
            finishes: AtomicUsize::new(0),
        })
    }
}

impl SinkConsumer for CountingConsumer {
    fn consume(&self, batch: Batch) -> Result<(), EngineError> {
        self.batches.fetch_add(1, Ordering::AcqRel);
        self.rows.fetch_add(batch.len(), Ordering::AcqRel);
        Ok(())
    }

    fn finish(&self) -> Result<(), EngineError> {
        self.finishes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[test]
fn concurrent_delivery_finalizes_exactly_once() {
    init_test_config();
    const BATCHES: usize = 16;
    for _ in 0..20 {
        let (ctx, pool) = test_context();
        let plan = ExecPlan::new(ctx);
        let source = plan
            .add_node(
                "source",
                &[],
                NodeOptions::Source(SourceNodeOptions {
                    output_schema: int64_schema("x"),
                    generator: vec_generator(Vec::new()),
                }),
            )
            .expect("source");
        let aggregate = plan
            .add_node(
                "aggregate",
                &[source],
                NodeOptions::Aggregate(sum_aggregate(0)),
            )
            .expect("aggregate");
        let consumer = CountingConsumer::new();
        plan.add_node(
            "consuming_sink",
            &[aggregate],
            NodeOptions::ConsumingSink(ConsumingSinkNodeOptions {
                consumer: consumer.clone(),
            }),
        )
        .expect("sink");
        // Bypass the source and hammer the aggregate directly so the
        // final batch and the total announcement race.
        let node = plan.node(aggregate).expect("aggregate node");
        let mut handles = Vec::new();
        for _ in 0..BATCHES {
            let node = Arc::clone(&node);
            handles.push(std::thread::spawn(move || {
                node.input_received(source, int64_batch("x", &[1]));
            }));
        }
        {
            let node = Arc::clone(&node);
            handles.push(std::thread::spawn(move || {
                node.input_finished(source, BATCHES);
            }));
        }
        for handle in handles {
            handle.join().expect("join");
        }
        node.finished().wait().expect("aggregate finished");
        assert_eq!(consumer.batches.load(Ordering::Acquire), 1);
        assert_eq!(consumer.rows.load(Ordering::Acquire), 1);
        assert_eq!(consumer.finishes.load(Ordering::Acquire), 1);
        pool.shutdown(true);
    }
}

#[test]
fn stop_terminates_an_unbounded_source() {
    init_test_config();
    let (ctx, pool) = test_context();
    let plan = ExecPlan::new(ctx);
    let source = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("x"),
                generator: iter_generator(std::iter::repeat_with(|| Ok(int64_batch("x", &[1])))),
            }),
        )
        .expect("source");
    let consumer = CountingConsumer::new();
    plan.add_node(
        "consuming_sink",
        &[source],
        NodeOptions::ConsumingSink(ConsumingSinkNodeOptions {
            consumer: consumer.clone(),
        }),
    )
    .expect("sink");
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    std::thread::sleep(Duration::from_millis(30));
    plan.stop_producing();
    plan.finished().wait().expect("finished");
    assert_eq!(plan.state(), PlanState::Stopped);
    assert!(consumer.batches.load(Ordering::Acquire) > 0);
    pool.shutdown(false);
}

#[test]
fn generator_error_fails_the_plan() {
    init_test_config();
    let (ctx, pool) = test_context();
    let plan = ExecPlan::new(ctx);
    // Two healthy batches, then the reader dies; trailing items must
    // never be pulled.
    let mut items: Vec<Result<Batch, EngineError>> = vec![
        Ok(int64_batch("x", &[1])),
        Ok(int64_batch("x", &[2])),
        Err(EngineError::execution("reader exploded")),
    ];
    for v in 4..=10 {
        items.push(Ok(int64_batch("x", &[v])));
    }
    let source = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("x"),
                generator: iter_generator(items.into_iter()),
            }),
        )
        .expect("source");
    let aggregate = plan
        .add_node(
            "aggregate",
            &[source],
            NodeOptions::Aggregate(sum_aggregate(0)),
        )
        .expect("aggregate");
    let sink = plan
        .add_node(
            "sink",
            &[aggregate],
            NodeOptions::Sink(SinkNodeOptions::default()),
        )
        .expect("sink");
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    match plan.finished().wait() {
        Err(EngineError::Execution(msg)) => assert_eq!(msg, "reader exploded"),
        other => panic!("unexpected result: {other:?}"),
    }
    // The sink's pull side surfaces the same failure.
    let generator = sink_generator(&plan, sink);
    assert!(drain(&generator).is_err());
    assert_eq!(plan.state(), PlanState::Stopped);
    pool.shutdown(false);
}

#[test]
fn filter_and_project_transform_batches() {
    init_test_config();
    let (ctx, pool) = test_context();
    let plan = ExecPlan::new(ctx);
    let source = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("x"),
                generator: vec_generator(vec![int64_batch("x", &[1, 2, 3, 4, 5, 6])]),
            }),
        )
        .expect("source");
    let filter = plan
        .add_node(
            "filter",
            &[source],
            NodeOptions::Filter(FilterNodeOptions {
                predicate: Expr::Gt(Box::new(Expr::col(0)), Box::new(Expr::lit_i64(3))),
            }),
        )
        .expect("filter");
    let project = plan
        .add_node(
            "project",
            &[filter],
            NodeOptions::Project(ProjectNodeOptions {
                expressions: vec![Expr::Mul(Box::new(Expr::col(0)), Box::new(Expr::lit_i64(2)))],
                output_names: vec!["doubled".to_string()],
            }),
        )
        .expect("project");
    let sink = plan
        .add_node(
            "sink",
            &[project],
            NodeOptions::Sink(SinkNodeOptions::default()),
        )
        .expect("sink");
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    plan.finished().wait().expect("finished");
    let generator = sink_generator(&plan, sink);
    let batches = drain(&generator).expect("drain");
    assert_eq!(int64_values(&batches, 0), vec![8, 10, 12]);
    pool.shutdown(true);
}

#[test]
fn backpressure_throttles_then_drains_everything() {
    init_test_config();
    const BATCHES: i64 = 20;
    let (ctx, pool) = test_context();
    let plan = ExecPlan::new(ctx);
    let input: Vec<Batch> = (0..BATCHES).map(|v| int64_batch("x", &[v])).collect();
    let source = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("x"),
                generator: vec_generator(input),
            }),
        )
        .expect("source");
    let sink = plan
        .add_node(
            "sink",
            &[source],
            NodeOptions::Sink(SinkNodeOptions {
                // One queued batch is already past the high mark, so the
                // source pauses until the caller drains.
                backpressure: Some(BackpressureOptions {
                    low_watermark_bytes: 1,
                    high_watermark_bytes: 1,
                }),
            }),
        )
        .expect("sink");
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    let generator = sink_generator(&plan, sink);
    let batches = drain(&generator).expect("drain");
    assert_eq!(batches.len(), BATCHES as usize);
    let mut values = int64_values(&batches, 0);
    values.sort_unstable();
    assert_eq!(values, (0..BATCHES).collect::<Vec<_>>());
    plan.finished().wait().expect("finished");
    pool.shutdown(true);
}

#[test]
fn order_by_emits_a_globally_sorted_stream() {
    init_test_config();
    let (ctx, pool) = test_context();
    let plan = ExecPlan::new(ctx);
    let source = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("x"),
                generator: vec_generator(vec![
                    int64_batch("x", &[5, 1]),
                    int64_batch("x", &[4, 2, 9]),
                ]),
            }),
        )
        .expect("source");
    let order_by = plan
        .add_node(
            "order_by",
            &[source],
            NodeOptions::OrderBy(OrderByNodeOptions {
                sort_keys: vec![SortKey {
                    column: 0,
                    descending: true,
                }],
                limit: None,
            }),
        )
        .expect("order_by");
    let sink = plan
        .add_node(
            "sink",
            &[order_by],
            NodeOptions::Sink(SinkNodeOptions::default()),
        )
        .expect("sink");
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    plan.finished().wait().expect("finished");
    let generator = sink_generator(&plan, sink);
    let batches = drain(&generator).expect("drain");
    // Five sorted rows against the four-row chunk limit: two batches,
    // order preserved across the chunk boundary.
    assert_eq!(batches.len(), 2);
    assert_eq!(int64_values(&batches, 0), vec![9, 5, 4, 2, 1]);
    pool.shutdown(true);
}

#[test]
fn top_k_truncates_the_sorted_stream() {
    init_test_config();
    let (ctx, pool) = test_context();
    let plan = ExecPlan::new(ctx);
    let source = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("x"),
                generator: vec_generator(vec![int64_batch("x", &[5, 1, 4, 2, 9])]),
            }),
        )
        .expect("source");
    let top_k = plan
        .add_node(
            "order_by",
            &[source],
            NodeOptions::OrderBy(OrderByNodeOptions {
                sort_keys: vec![SortKey {
                    column: 0,
                    descending: true,
                }],
                limit: Some(3),
            }),
        )
        .expect("top_k");
    let sink = plan
        .add_node(
            "sink",
            &[top_k],
            NodeOptions::Sink(SinkNodeOptions::default()),
        )
        .expect("sink");
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    plan.finished().wait().expect("finished");
    let generator = sink_generator(&plan, sink);
    let batches = drain(&generator).expect("drain");
    assert_eq!(int64_values(&batches, 0), vec![9, 5, 4]);
    pool.shutdown(true);
}

#[test]
fn hash_join_matches_key_pairs() {
    init_test_config();
    let (ctx, pool) = test_context();
    let plan = ExecPlan::new(ctx);
    let left = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("id"),
                generator: vec_generator(vec![int64_batch("id", &[1, 2, 3])]),
            }),
        )
        .expect("left source");
    let right = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("rid"),
                generator: vec_generator(vec![int64_batch("rid", &[2, 3, 4])]),
            }),
        )
        .expect("right source");
    let join = plan
        .add_node(
            "hash_join",
            &[left, right],
            NodeOptions::HashJoin(HashJoinNodeOptions {
                left_keys: vec![0],
                right_keys: vec![0],
            }),
        )
        .expect("join");
    let schema = plan.node(join).expect("node").output_schema();
    assert_eq!(schema.field(0).name(), "id");
    assert_eq!(schema.field(1).name(), "rid");
    let sink = plan
        .add_node(
            "sink",
            &[join],
            NodeOptions::Sink(SinkNodeOptions::default()),
        )
        .expect("sink");
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    plan.finished().wait().expect("finished");
    let generator = sink_generator(&plan, sink);
    let batches = drain(&generator).expect("drain");
    let mut left_values = int64_values(&batches, 0);
    left_values.sort_unstable();
    // Non-matching probe rows are dropped; matched pairs carry equal
    // key values on both sides.
    assert_eq!(left_values, vec![2, 3]);
    assert_eq!(int64_values(&batches, 0), int64_values(&batches, 1));
    pool.shutdown(true);
}

#[test]
fn join_finish_waits_for_parked_probe_flush() {
    init_test_config();
    const PROBE_BATCHES: usize = 32;
    const ROWS: i64 = 64;
    for _ in 0..10 {
        let (ctx, pool) = test_context();
        let plan = ExecPlan::new(ctx);
        let left = plan
            .add_node(
                "source",
                &[],
                NodeOptions::Source(SourceNodeOptions {
                    output_schema: int64_schema("id"),
                    generator: vec_generator(Vec::new()),
                }),
            )
            .expect("left source");
        let right = plan
            .add_node(
                "source",
                &[],
                NodeOptions::Source(SourceNodeOptions {
                    output_schema: int64_schema("rid"),
                    generator: vec_generator(Vec::new()),
                }),
            )
            .expect("right source");
        let join = plan
            .add_node(
                "hash_join",
                &[left, right],
                NodeOptions::HashJoin(HashJoinNodeOptions {
                    left_keys: vec![0],
                    right_keys: vec![0],
                }),
            )
            .expect("join");
        let consumer = CountingConsumer::new();
        plan.add_node(
            "consuming_sink",
            &[join],
            NodeOptions::ConsumingSink(ConsumingSinkNodeOptions {
                consumer: consumer.clone(),
            }),
        )
        .expect("sink");
        let node = plan.node(join).expect("join node");
        // Sample the delivered row count at the instant the join's
        // finished future resolves: every joined row must already be
        // downstream by then.
        let rows_at_finish = Arc::new(AtomicUsize::new(usize::MAX));
        {
            let sample = Arc::clone(&rows_at_finish);
            let consumer = Arc::clone(&consumer);
            node.finished().add_callback(move |_| {
                sample.store(consumer.rows.load(Ordering::Acquire), Ordering::Release);
            });
        }
        let values: Vec<i64> = (0..ROWS).collect();
        // Park the whole probe side before any build batch exists.
        for _ in 0..PROBE_BATCHES {
            node.input_received(left, int64_batch("id", &values));
        }
        let builder = {
            let node = Arc::clone(&node);
            let values = values.clone();
            std::thread::spawn(move || {
                node.input_received(right, int64_batch("rid", &values));
                node.input_finished(right, 1);
            })
        };
        // Race the probe total announcement against the parked flush.
        node.input_finished(left, PROBE_BATCHES);
        builder.join().expect("builder thread");
        node.finished().wait().expect("join finished");
        assert_eq!(
            rows_at_finish.load(Ordering::Acquire),
            PROBE_BATCHES * ROWS as usize
        );
        pool.shutdown(true);
    }
}

#[test]
fn source_error_resolves_after_inflight_pushes_drain() {
    init_test_config();
    let executor = SerialExecutor::new();
    let plan = ExecPlan::new(ExecContext::with_executor(executor.clone()));
    // Two healthy batches, then the generator dies. Their push tasks are
    // still queued on the executor when the error surfaces.
    let items: Vec<Result<Batch, EngineError>> = vec![
        Ok(int64_batch("x", &[1])),
        Ok(int64_batch("x", &[2])),
        Err(EngineError::execution("reader exploded")),
    ];
    let source = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("x"),
                generator: iter_generator(items.into_iter()),
            }),
        )
        .expect("source");
    let consumer = CountingConsumer::new();
    plan.add_node(
        "consuming_sink",
        &[source],
        NodeOptions::ConsumingSink(ConsumingSinkNodeOptions {
            consumer: consumer.clone(),
        }),
    )
    .expect("sink");
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    let batches_at_finish = Arc::new(AtomicUsize::new(usize::MAX));
    {
        let sample = Arc::clone(&batches_at_finish);
        let consumer = Arc::clone(&consumer);
        plan.node(source)
            .expect("source node")
            .finished()
            .add_callback(move |_| {
                sample.store(consumer.batches.load(Ordering::Acquire), Ordering::Release);
            });
    }
    {
        let executor = executor.clone();
        plan.finished().add_callback(move |_| executor.mark_finished());
    }
    executor.run_loop();
    match plan.finished().wait() {
        Err(EngineError::Execution(msg)) => assert_eq!(msg, "reader exploded"),
        other => panic!("unexpected result: {other:?}"),
    }
    // Both healthy batches were delivered before the source settled.
    assert_eq!(batches_at_finish.load(Ordering::Acquire), 2);
}

#[test]
fn kernel_error_mid_stream_fails_the_plan() {
    init_test_config();
    let (ctx, pool) = test_context();
    let plan = ExecPlan::new(ctx);
    // Healthy Int64 batches, then one whose column arrives as Float64;
    // the sum kernel rejects it mid-stream. The generator never ends on
    // its own, so only the error's cooperative stop terminates the plan.
    let float_schema: SchemaRef = Arc::new(Schema::new(vec![Field::new(
        "x",
        DataType::Float64,
        false,
    )]));
    let bad = Batch::new(
        RecordBatch::try_new(
            float_schema,
            vec![Arc::new(Float64Array::from(vec![1.5])) as ArrayRef],
        )
        .expect("record batch"),
    );
    let items = vec![
        Ok(int64_batch("x", &[1])),
        Ok(int64_batch("x", &[2])),
        Ok(bad),
    ]
    .into_iter()
    .chain(std::iter::repeat_with(|| Ok(int64_batch("x", &[3]))));
    let source = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("x"),
                generator: iter_generator(items),
            }),
        )
        .expect("source");
    let aggregate = plan
        .add_node(
            "aggregate",
            &[source],
            NodeOptions::Aggregate(sum_aggregate(0)),
        )
        .expect("aggregate");
    let sink = plan
        .add_node(
            "sink",
            &[aggregate],
            NodeOptions::Sink(SinkNodeOptions::default()),
        )
        .expect("sink");
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    match plan.finished().wait() {
        Err(EngineError::KernelDispatch {
            function,
            input_type,
        }) => {
            assert_eq!(function, "sum");
            assert_eq!(input_type, "Float64");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    // The sink's pull side surfaces the same failure.
    let generator = sink_generator(&plan, sink);
    assert!(drain(&generator).is_err());
    assert_eq!(plan.state(), PlanState::Stopped);
    pool.shutdown(false);
}

#[test]
fn mean_outputs_float64() {
    init_test_config();
    let (ctx, pool) = test_context();
    let plan = ExecPlan::new(ctx);
    let source = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("x"),
                generator: vec_generator(vec![int64_batch("x", &[1, 2, 3, 4])]),
            }),
        )
        .expect("source");
    let aggregate = plan
        .add_node(
            "aggregate",
            &[source],
            NodeOptions::Aggregate(AggregateNodeOptions {
                aggregates: vec![Aggregate {
                    function: "mean".to_string(),
                    target: 0,
                    output_name: "mean_x".to_string(),
                }],
                keys: vec![],
            }),
        )
        .expect("aggregate");
    let sink = plan
        .add_node(
            "sink",
            &[aggregate],
            NodeOptions::Sink(SinkNodeOptions::default()),
        )
        .expect("sink");
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    plan.finished().wait().expect("finished");
    let generator = sink_generator(&plan, sink);
    let batches = drain(&generator).expect("drain");
    let means = batches[0]
        .column(0)
        .as_any()
        .downcast_ref::<Float64Array>()
        .expect("f64 column");
    assert_eq!(means.value(0), 2.5);
    pool.shutdown(true);
}

#[test]
fn validation_rejects_a_dangling_node() {
    init_test_config();
    let (ctx, pool) = test_context();
    let plan = ExecPlan::new(ctx);
    plan.add_node(
        "source",
        &[],
        NodeOptions::Source(SourceNodeOptions {
            output_schema: int64_schema("x"),
            generator: vec_generator(Vec::new()),
        }),
    )
    .expect("source");
    let err = plan.validate().expect_err("must fail");
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    // An unvalidated plan refuses to start.
    let err = plan.start_producing().expect_err("must fail");
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    pool.shutdown(false);
}

#[test]
fn nodes_cannot_be_added_after_start() {
    init_test_config();
    let (plan, _sink, pool) = sum_plan(vec![int64_batch("x", &[1])]);
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    let err = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("y"),
                generator: vec_generator(Vec::new()),
            }),
        )
        .expect_err("must fail");
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    plan.finished().wait().expect("finished");
    pool.shutdown(true);
}

#[test]
fn serial_executor_runs_a_whole_plan() {
    init_test_config();
    let executor = SerialExecutor::new();
    let plan = ExecPlan::new(ExecContext::with_executor(executor.clone()));
    let source = plan
        .add_node(
            "source",
            &[],
            NodeOptions::Source(SourceNodeOptions {
                output_schema: int64_schema("x"),
                generator: vec_generator(vec![int64_batch("x", &[1, 2]), int64_batch("x", &[3])]),
            }),
        )
        .expect("source");
    let aggregate = plan
        .add_node(
            "aggregate",
            &[source],
            NodeOptions::Aggregate(sum_aggregate(0)),
        )
        .expect("aggregate");
    let consumer = CountingConsumer::new();
    plan.add_node(
        "consuming_sink",
        &[aggregate],
        NodeOptions::ConsumingSink(ConsumingSinkNodeOptions {
            consumer: consumer.clone(),
        }),
    )
    .expect("sink");
    plan.validate().expect("validate");
    plan.start_producing().expect("start");
    {
        let executor = executor.clone();
        plan.finished().add_callback(move |_| executor.mark_finished());
    }
    // The whole plan runs on this thread.
    executor.run_loop();
    plan.finished().wait().expect("finished");
    assert_eq!(consumer.batches.load(Ordering::Acquire), 1);
    assert_eq!(consumer.rows.load(Ordering::Acquire), 1);
    assert_eq!(consumer.finishes.load(Ordering::Acquire), 1);
}
