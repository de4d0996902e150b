use crate::infrastructure::{AsyncScriptedResource, CallLog, OnExit, ScriptedResource};
use eyre::Result;
use exitstack::{ExitError, ExitStack};

/// Three plain callbacks run newest first and nothing is suppressed
#[tokio::test]
async fn test_close_runs_callbacks_in_reverse() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();
    stack
        .callback(log.recorder("C1"))
        .callback(log.recorder("C2"))
        .callback(log.recorder("C3"));

    let suppressed = stack.close().await?;

    assert!(!suppressed);
    assert_eq!(log.entries(), vec!["C3", "C2", "C1"]);
    Ok(())
}

/// Every action runs exactly once when nothing fails
#[tokio::test]
async fn test_no_error_path_runs_each_action_once() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();
    stack.push(ScriptedResource::new("sync", &log, OnExit::Pass));
    stack.push_async(AsyncScriptedResource(ScriptedResource::new("async", &log, OnExit::Pass)));
    stack.callback(log.recorder("callback"));

    assert!(!stack.close().await?);
    assert!(!stack.close().await?);

    assert_eq!(log.entries(), vec!["callback", "async:", "sync:"]);
    Ok(())
}

/// Synchronous and asynchronous actions interleave in registration order
#[tokio::test]
async fn test_mixed_sync_and_async_order() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();
    for i in 0..6 {
        let name = format!("a{}", i);
        if i % 2 == 0 {
            stack.callback(log.recorder(&name));
        } else {
            let log = log.clone();
            stack.callback_async(move || async move {
                tokio::task::yield_now().await;
                log.record(name);
                Ok::<_, eyre::Report>(())
            });
        }
    }

    stack.close().await?;
    assert_eq!(log.entries(), vec!["a5", "a4", "a3", "a2", "a1", "a0"]);
    Ok(())
}

/// A suppressing context action clears the entry error for what runs after it
#[tokio::test]
async fn test_suppression_semantics() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();
    stack.push(ScriptedResource::new("A1", &log, OnExit::Suppress));
    stack.callback(log.recorder("A2"));

    let entry = ExitError::msg("E");
    let suppressed = stack.unwind(Some(&entry)).await?;

    assert!(suppressed);
    assert_eq!(log.entries(), vec!["A2", "A1:E"]);
    Ok(())
}

/// Actions registered before the suppressor see no error
#[tokio::test]
async fn test_actions_after_suppression_see_no_error() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();
    stack.push(ScriptedResource::new("outer", &log, OnExit::Pass));
    stack.push_async(AsyncScriptedResource(ScriptedResource::new("middle", &log, OnExit::Suppress)));
    stack.push(ScriptedResource::new("inner", &log, OnExit::Pass));

    let entry = ExitError::msg("E");
    assert!(stack.unwind(Some(&entry)).await?);
    assert_eq!(log.entries(), vec!["inner:E", "middle:E", "outer:"]);
    Ok(())
}

/// A failing action's error propagates with the entry error as its cause
#[tokio::test]
async fn test_failure_chains_onto_entry_error() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();
    stack.push(ScriptedResource::new("A1", &log, OnExit::Fail("F")));

    let entry = ExitError::msg("E");
    let raised = stack.unwind(Some(&entry)).await.unwrap_err();

    assert_eq!(raised.to_string(), "F");
    let cause = raised.caused_by().expect("F should record E");
    assert!(cause.is(&entry));
    assert!(cause.caused_by().is_none());
    Ok(())
}

/// Successive failures form a chain in nesting order
#[tokio::test]
async fn test_successive_failures_chain_in_order() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();
    stack.push(ScriptedResource::new("first", &log, OnExit::Fail("first failed")));
    stack.push(ScriptedResource::new("second", &log, OnExit::Pass));
    stack.push(ScriptedResource::new("third", &log, OnExit::Fail("third failed")));

    let entry = ExitError::msg("body failed");
    let raised = stack.unwind(Some(&entry)).await.unwrap_err();

    let chain: Vec<_> = raised.chain().map(|e| e.to_string()).collect();
    assert_eq!(chain, vec!["first failed", "third failed", "body failed"]);
    assert_eq!(
        log.entries(),
        vec!["third:body failed", "second:third failed", "first:third failed"]
    );
    Ok(())
}

/// A failure raised after a suppression starts a fresh chain
#[tokio::test]
async fn test_failure_after_suppression_has_no_cause() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();
    stack.push(ScriptedResource::new("outer", &log, OnExit::Fail("late")));
    stack.push(ScriptedResource::new("inner", &log, OnExit::Suppress));

    let entry = ExitError::msg("E");
    let raised = stack.unwind(Some(&entry)).await.unwrap_err();
    assert_eq!(raised.to_string(), "late");
    assert!(raised.caused_by().is_none());
    Ok(())
}

/// A suppressor clears a failure raised by an action that ran before it
#[tokio::test]
async fn test_suppression_of_cleanup_failure() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();
    stack.push(ScriptedResource::new("suppressor", &log, OnExit::Suppress));
    stack.push(ScriptedResource::new("failing", &log, OnExit::Fail("cleanup failed")));

    // no entry error, so nothing received is reported as suppressed
    assert!(!stack.close().await?);
    assert_eq!(log.entries(), vec!["failing:", "suppressor:cleanup failed"]);
    Ok(())
}

/// A plain callback returning true changes nothing
#[tokio::test]
async fn test_plain_callback_cannot_suppress() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();
    stack.push(ScriptedResource::new("outer", &log, OnExit::Pass));
    stack.callback(|| Ok(true));
    stack.callback_async(|| async { Ok::<_, eyre::Report>(true) });

    let entry = ExitError::msg("E");
    assert!(!stack.unwind(Some(&entry)).await?);
    assert_eq!(log.entries(), vec!["outer:E"]);
    Ok(())
}

/// Bare exit callables see the in-flight error and may suppress it
#[tokio::test]
async fn test_bare_exit_callables() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();

    let sync_log = log.clone();
    stack.push_fn(move |pending| {
        sync_log.record(format!("sync:{}", pending.map(|e| e.to_string()).unwrap_or_default()));
        Ok(false)
    });
    let async_log = log.clone();
    stack.push_async_fn(move |pending| async move {
        async_log.record(format!("async:{}", pending.map(|e| e.to_string()).unwrap_or_default()));
        Ok::<_, eyre::Report>(true)
    });

    let entry = ExitError::msg("E");
    assert!(stack.unwind(Some(&entry)).await?);
    assert_eq!(log.entries(), vec!["async:E", "sync:"]);
    Ok(())
}

/// After pop_all the source owns nothing and the new stack owns everything
#[tokio::test]
async fn test_pop_all_transfers_actions() -> Result<()> {
    let log = CallLog::new();
    let mut first = ExitStack::new();
    first
        .callback(log.recorder("one"))
        .callback(log.recorder("two"))
        .callback(log.recorder("three"));

    let mut second = first.pop_all();
    assert!(first.is_empty());
    assert_eq!(second.len(), 3);

    first.close().await?;
    assert!(log.entries().is_empty());

    second.close().await?;
    assert_eq!(log.entries(), vec!["three", "two", "one"]);
    Ok(())
}

/// pop_all hands acquired resources out of a setup function only on success
#[tokio::test]
async fn test_pop_all_handoff_from_setup() -> Result<()> {
    async fn acquire_all(log: &CallLog, fail_last: bool) -> eyre::Result<ExitStack> {
        let mut stack = ExitStack::new();
        stack.enter_scope(ScriptedResource::new("db", log, OnExit::Pass))?;
        let mut cache = ScriptedResource::new("cache", log, OnExit::Pass);
        cache.fail_enter = fail_last;
        let entered = stack.enter_scope(cache);
        match entered {
            Ok(_) => Ok(stack.pop_all()),
            Err(e) => {
                let error = ExitError::from(e);
                stack.unwind(Some(&error)).await?;
                Err(error.into())
            }
        }
    }

    let log = CallLog::new();
    let mut owned = acquire_all(&log, false).await?;
    assert_eq!(log.entries(), vec!["enter db", "enter cache"]);
    owned.close().await?;
    assert_eq!(log.entries()[2..], ["cache:", "db:"]);

    let log = CallLog::new();
    let err = acquire_all(&log, true).await.unwrap_err();
    assert_eq!(err.to_string(), "cache refused to enter");
    assert_eq!(log.entries(), vec!["enter db", "db:cache refused to enter"]);
    Ok(())
}

/// A failed enter registers nothing and never unwinds
#[tokio::test]
async fn test_failed_enter_registers_nothing() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();

    let mut resource = AsyncScriptedResource(ScriptedResource::new("broken", &log, OnExit::Pass));
    resource.0.fail_enter = true;
    let err = stack.enter_async_scope(resource).await.unwrap_err();

    assert_eq!(err.to_string(), "broken refused to enter");
    assert!(stack.is_empty());
    assert!(log.entries().is_empty());
    Ok(())
}

/// enter_async_scope returns what enter produced and exits on close
#[tokio::test]
async fn test_enter_async_scope() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();

    let name = stack
        .enter_async_scope(AsyncScriptedResource(ScriptedResource::new("svc", &log, OnExit::Pass)))
        .await?;
    assert_eq!(name, "svc");

    stack.close().await?;
    assert_eq!(log.entries(), vec!["enter svc", "svc:"]);
    Ok(())
}

/// finish closes on success and reports the body's error otherwise
#[tokio::test]
async fn test_finish_guards_a_body() -> Result<()> {
    let log = CallLog::new();

    let mut stack = ExitStack::new();
    stack.callback(log.recorder("cleanup"));
    let value = stack.finish(Ok::<_, ExitError>("done")).await?;
    assert_eq!(value, Some("done"));

    let mut stack = ExitStack::new();
    stack.push(ScriptedResource::new("failing", &log, OnExit::Fail("cleanup failed")));
    let body_error = ExitError::msg("body failed");
    let raised = stack.finish::<()>(Err(body_error.clone())).await.unwrap_err();
    assert_eq!(raised.to_string(), "cleanup failed");
    assert!(raised.caused_by().unwrap().is(&body_error));
    Ok(())
}

/// The full history is visible through an eyre report
#[tokio::test]
async fn test_report_shows_chain() -> Result<()> {
    let log = CallLog::new();
    let mut stack = ExitStack::new();
    stack.push(ScriptedResource::new("closer", &log, OnExit::Fail("close failed")));

    let entry = ExitError::msg("request failed");
    let report = eyre::Report::from(stack.unwind(Some(&entry)).await.unwrap_err());

    let messages: Vec<_> = report.chain().map(|e| e.to_string()).collect();
    assert_eq!(messages, vec!["close failed", "request failed"]);
    Ok(())
}
