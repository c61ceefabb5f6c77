//! Pipeline execution with per-stage disk caching.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::util::Dedup;

use super::template::interpolate;
use super::{Artifact, PipelineError, Result, Vars};

/// First stage of a pipeline: produces bytes from scratch.
#[async_trait]
pub trait Source: Send + Sync {
    /// Cache path template for this stage's output, if cached.
    fn template(&self) -> Option<String> {
        None
    }

    async fn open(&self, vars: &Vars, out: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()>;
}

/// Any subsequent stage: consumes the previous stage's byte stream.
#[async_trait]
pub trait Step: Send + Sync {
    /// Cache path template for this stage's output, if cached.
    fn template(&self) -> Option<String> {
        None
    }

    async fn run(
        &self,
        vars: &Vars,
        input: &mut (dyn AsyncBufRead + Send + Unpin),
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;
}

/// Output of one executed (or cache-hit) stage.
enum StageData {
    File(PathBuf),
    Memory(Vec<u8>),
}

impl StageData {
    async fn reader(&self) -> Result<Box<dyn AsyncBufRead + Send + Unpin>> {
        match self {
            StageData::File(path) => {
                let file = fs::File::open(path).await?;
                Ok(Box::new(BufReader::new(file)))
            }
            StageData::Memory(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
        }
    }
}

/// Runs pipelines against a cache directory.
pub struct PipelineRuntime {
    cache_dir: PathBuf,
    flights: Dedup<String, Artifact, PipelineError>,
    /// Distinguishes temp files when different final artifacts share an
    /// intermediate stage path.
    temp_seq: AtomicU64,
}

impl PipelineRuntime {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            flights: Dedup::new(),
            temp_seq: AtomicU64::new(0),
        }
    }

    pub fn cache_dir(&self) -> &std::path::Path {
        &self.cache_dir
    }

    /// Run the pipeline `source → steps…` for `vars`.
    ///
    /// The last stage must declare a template; its file becomes the
    /// artifact. Concurrent invocations that resolve to the same
    /// artifact path execute once.
    pub async fn run(
        &self,
        vars: &Vars,
        source: &dyn Source,
        steps: &[&dyn Step],
    ) -> Result<Artifact> {
        let final_template = match steps.last() {
            Some(step) => step.template(),
            None => source.template(),
        }
        .ok_or(PipelineError::NoArtifactTemplate)?;
        let final_rel = interpolate(&final_template, vars)?;

        let vars = vars.clone();
        self.flights
            .run(final_rel.clone(), || self.execute(vars, source, steps, final_rel.clone()))
            .await
    }

    async fn execute(
        &self,
        vars: Vars,
        source: &dyn Source,
        steps: &[&dyn Step],
        final_rel: String,
    ) -> Result<Artifact> {
        let final_path = self.cache_dir.join(&final_rel);
        let artifact = Artifact::new(
            final_path.clone(),
            vars.get_or_empty("commit").to_string(),
            vars.get_or_empty("ctx.auth.group").to_string(),
        );

        if fs::try_exists(&final_path).await? {
            return Ok(artifact);
        }

        // Find the latest stage whose cached output already exists; the
        // chain resumes just after it. Index 0 is the source.
        let stage_count = steps.len() + 1;
        let mut resume = 0usize;
        let mut current: Option<StageData> = None;
        for index in (0..stage_count).rev() {
            let template = if index == 0 {
                source.template()
            } else {
                steps[index - 1].template()
            };
            if let Some(template) = template {
                let path = self.cache_dir.join(interpolate(&template, &vars)?);
                if fs::try_exists(&path).await? {
                    resume = index + 1;
                    current = Some(StageData::File(path));
                    break;
                }
            }
        }

        for index in resume..stage_count {
            let template = if index == 0 {
                source.template()
            } else {
                steps[index - 1].template()
            };

            let output = match template {
                Some(template) => {
                    let rel = interpolate(&template, &vars)?;
                    let path = self.cache_dir.join(rel);
                    self.run_stage_to_file(&vars, source, steps, index, &current, &path)
                        .await?;
                    StageData::File(path)
                }
                None => {
                    let mut buf: Vec<u8> = Vec::new();
                    self.run_stage(&vars, source, steps, index, &current, &mut buf)
                        .await?;
                    StageData::Memory(buf)
                }
            };
            current = Some(output);
        }

        Ok(artifact)
    }

    async fn run_stage(
        &self,
        vars: &Vars,
        source: &dyn Source,
        steps: &[&dyn Step],
        index: usize,
        input: &Option<StageData>,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        if index == 0 {
            source.open(vars, out).await
        } else {
            let input = input
                .as_ref()
                .ok_or_else(|| PipelineError::Other("step has no input stage".to_string()))?;
            let mut reader = input.reader().await?;
            steps[index - 1].run(vars, &mut reader, out).await
        }
    }

    /// Run a cached stage: write to a temp file, rename into place on
    /// success, remove the temp file on failure.
    async fn run_stage_to_file(
        &self,
        vars: &Vars,
        source: &dyn Source,
        steps: &[&dyn Step],
        index: usize,
        input: &Option<StageData>,
        path: &std::path::Path,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let mut temp = path.as_os_str().to_owned();
        temp.push(format!(".tmp{seq}"));
        let temp = PathBuf::from(temp);

        let result = async {
            let file = fs::File::create(&temp).await?;
            let mut writer = BufWriter::new(file);
            self.run_stage(vars, source, steps, index, input, &mut writer)
                .await?;
            writer.flush().await?;
            Ok::<(), PipelineError>(())
        }
        .await;

        match result {
            Ok(()) => {
                fs::rename(&temp, path).await?;
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&temp).await;
                Err(err)
            }
        }
    }
}
