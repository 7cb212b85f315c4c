//! Pipeline handlers: the contract the coordinator drives, and the two
//! interchangeable backends implementing it.

pub mod compat;
pub mod external;
pub mod ffmpeg;
pub mod profiles;

use async_trait::async_trait;

use crate::error::JobError;
use crate::job::model::{JobInfo, UploadJobResult};

pub use compat::check_in_process_support;
pub use external::{ExternalPipeline, ProviderCallbacks, ProviderOutputs, ProviderRequest, TranscodeProvider};
pub use ffmpeg::FfmpegPipeline;
pub use profiles::resolve_profiles;

/// Outcome of one handler invocation.
#[derive(Debug)]
pub enum HandlerOutput {
    /// The job keeps running outside this critical section; do not finalize.
    Continue,
    /// The job finished synchronously with this result.
    Result(UploadJobResult),
}

/// One pipeline backend. Runs to completion inside the coordinator's
/// per-job critical section; errors may be tagged unretriable.
#[async_trait]
pub trait PipelineHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle_start_upload_job(
        &self,
        job: &mut JobInfo,
    ) -> Result<HandlerOutput, JobError>;
}
