use crate::CollectorError;
use std::future::Future;
use std::time::Duration;
use tracing::info;

/// Runs `task` over consecutive batches of at most `batch_size` inputs, one batch at a time.
///
/// Returns the number of batches processed. The first failing batch stops the run.
pub async fn complete_in_batches<T, F, Fut>(
    inputs: Vec<T>,
    batch_size: usize,
    mut task: F,
) -> Result<usize, CollectorError>
where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    if batch_size == 0 {
        return Err(CollectorError::Configuration(
            "Batch size must be greater than 0".to_string(),
        ));
    }

    let batch_count = (inputs.len() + batch_size - 1) / batch_size;
    let mut remaining = inputs.into_iter();

    for n in 1..=batch_count {
        let batch: Vec<T> = remaining.by_ref().take(batch_size).collect();
        info!("Starting work on batch {} of {} ({} items)", n, batch_count, batch.len());

        task(batch)
            .await
            .map_err(|e| CollectorError::HandlerFailed(format!("batch {}: {:#}", n, e)))?;
    }

    Ok(batch_count)
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}
