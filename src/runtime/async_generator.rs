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
//! Pull-based asynchronous batch generators.
//!
//! Responsibilities:
//! - Adapts batch producers (in-memory tables, blocking readers) into
//!   the zero-argument async pull contract consumed by source nodes.
//!
//! Key exported interfaces:
//! - Types: `AsyncGenerator`, `GeneratorFuture`.
//! - Functions: `vec_generator`, `iter_generator`, `background_generator`.

use std::sync::{Arc, Mutex};

use crate::common::error::Result;
use crate::exec::batch::Batch;
use crate::runtime::future::{ExecFuture, ExecPromise};
use crate::runtime::thread_pool::Executor;

/// Future of the next batch; `None` is the exhaustion sentinel, a failed
/// future is the error sentinel.
pub type GeneratorFuture = ExecFuture<Option<Batch>>;

/// Zero-argument asynchronous pull callable. Each invocation requests
/// the next batch; callers must not issue a new pull before the previous
/// future resolves.
pub type AsyncGenerator = Arc<dyn Fn() -> GeneratorFuture + Send + Sync>;

/// Generator over an in-memory batch list. Every pull resolves
/// immediately.
pub fn vec_generator(batches: Vec<Batch>) -> AsyncGenerator {
    iter_generator(batches.into_iter().map(Ok))
}

/// Generator over a synchronous fallible iterator, resolved inline.
pub fn iter_generator<I>(iter: I) -> AsyncGenerator
where
    I: Iterator<Item = Result<Batch>> + Send + 'static,
{
    let iter = Mutex::new(iter);
    Arc::new(move || {
        let next = iter.lock().expect("generator lock").next();
        match next {
            Some(Ok(batch)) => ExecFuture::ready(Ok(Some(batch))),
            Some(Err(err)) => ExecFuture::ready(Err(err)),
            None => ExecFuture::ready(Ok(None)),
        }
    })
}

/// Generator that evaluates a blocking iterator on an executor, so slow
/// producers never run on the thread issuing the pull.
pub fn background_generator<I>(iter: I, executor: Arc<dyn Executor>) -> AsyncGenerator
where
    I: Iterator<Item = Result<Batch>> + Send + 'static,
{
    let iter = Arc::new(Mutex::new(iter));
    Arc::new(move || {
        let (promise, future) = ExecPromise::new();
        let iter = Arc::clone(&iter);
        let spawned = executor.spawn(Box::new(move || {
            let next = iter.lock().expect("generator lock").next();
            promise.set(match next {
                Some(Ok(batch)) => Ok(Some(batch)),
                Some(Err(err)) => Err(err),
                None => Ok(None),
            });
        }));
        if let Err(err) = spawned {
            return ExecFuture::ready(Err(err));
        }
        future
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::EngineError;
    use crate::exec::batch::tests::int64_batch;
    use crate::runtime::thread_pool::ThreadPool;

    #[test]
    fn vec_generator_yields_then_exhausts() {
        let generator = vec_generator(vec![int64_batch("x", &[1, 2]), int64_batch("x", &[3])]);
        assert_eq!(generator().wait().expect("batch").expect("some").len(), 2);
        assert_eq!(generator().wait().expect("batch").expect("some").len(), 1);
        assert!(generator().wait().expect("batch").is_none());
        // Exhaustion is sticky.
        assert!(generator().wait().expect("batch").is_none());
    }

    #[test]
    fn iter_generator_surfaces_errors() {
        let generator = iter_generator(
            vec![
                Ok(int64_batch("x", &[1])),
                Err(EngineError::execution("reader failed")),
            ]
            .into_iter(),
        );
        assert!(generator().wait().expect("batch").is_some());
        assert!(generator().wait().is_err());
    }

    #[test]
    fn background_generator_pulls_on_executor() {
        let pool = ThreadPool::new(2);
        let generator = background_generator(
            vec![Ok(int64_batch("x", &[5, 6, 7]))].into_iter(),
            pool.clone(),
        );
        assert_eq!(generator().wait().expect("batch").expect("some").len(), 3);
        assert!(generator().wait().expect("batch").is_none());
        pool.shutdown(true);
    }
}
