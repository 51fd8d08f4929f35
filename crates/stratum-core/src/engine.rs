use crate::cache::{CacheProbe, CACHE_ID_KEY};
use crate::context::{clean_relative, resolve_copy_source};
use crate::session::{BuildSession, LayerOutcome};
use crate::CoreError;
use std::fs;
use std::path::{Path, PathBuf};
use stratum_runtime::{ExecRequest, LayerExecutor};
use stratum_schema::{
    combine_chain_id, command_cache_key, copy_cache_key, ChainId, Layer, LayerId, LayerType,
    MAX_LAYER_DEPTH,
};
use stratum_store::{content_digest, ChainCache, LayerStore};
use tracing::{debug, info, warn};

pub fn check_layer_limit(base: usize, new: usize) -> Result<(), CoreError> {
    let count = base + new;
    if count > MAX_LAYER_DEPTH {
        return Err(CoreError::LayerLimit {
            count,
            max: MAX_LAYER_DEPTH,
        });
    }
    Ok(())
}

/// Chain id after the parent image's layers. Skipped (unrealized) parent
/// layers contribute nothing.
pub fn base_chain_id(base_layers: &[Layer]) -> ChainId {
    base_layers
        .iter()
        .filter(|l| l.is_realized())
        .fold(ChainId::default(), |chain, l| {
            combine_chain_id(&chain, &format!("layer:{}", l.id))
        })
}

/// Realizes the new layers of a session in order.
///
/// Each layer's chain id extends the previous one with its cache key. While
/// caching is on, a probe hit reuses the recorded layer; the first miss turns
/// caching off for the rest of the build. Every realized layer is recorded in
/// the chain cache, and its data dir becomes a lower dir of later RUN/CMD
/// layers.
pub struct LayerEngine<'a> {
    layers: &'a LayerStore,
    cache: &'a dyn ChainCache,
    probe: &'a dyn CacheProbe,
    executor: &'a dyn LayerExecutor,
    staging: &'a Path,
}

impl<'a> LayerEngine<'a> {
    pub fn new(
        layers: &'a LayerStore,
        cache: &'a dyn ChainCache,
        probe: &'a dyn CacheProbe,
        executor: &'a dyn LayerExecutor,
        staging: &'a Path,
    ) -> Self {
        Self {
            layers,
            cache,
            probe,
            executor,
            staging,
        }
    }

    pub fn execute(&self, session: &mut BuildSession) -> Result<(), CoreError> {
        check_layer_limit(session.base_layers.len(), session.new_layers.len())?;
        fs::create_dir_all(self.staging)?;

        let mut lower_dirs: Vec<PathBuf> = session
            .base_layers
            .iter()
            .filter(|l| l.is_realized())
            .map(|l| self.layers.data_dir(&l.id))
            .collect();
        let mut parent = base_chain_id(&session.base_layers);
        let mut use_cache = !session.options.no_cache;
        let lite = session.options.mode.tolerates_failures();
        let context = session.context.dir.clone();
        session.outcomes.clear();

        for layer in &mut session.new_layers {
            info!("run build layer: {} {}", layer.layer_type, layer.value);
            let key = self.cache_key(layer, &context)?;
            let chain = combine_chain_id(&parent, &key);
            parent = chain.clone();

            let hit = if use_cache {
                self.probe.probe(&chain, layer, &key)
            } else {
                None
            };

            let (id, outcome) = if let Some(id) = hit {
                info!("use cache {} for {} {}", id.short(), layer.layer_type, layer.value);
                (id, LayerOutcome::CacheHit)
            } else {
                use_cache = false;
                match self.realize(layer, &key, &context, &lower_dirs) {
                    Ok(id) => (id, LayerOutcome::Executed),
                    Err(e @ CoreError::Execution { .. }) if lite => {
                        warn!("lite build: skipping layer, {e}");
                        session.outcomes.push(LayerOutcome::Skipped);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };

            if let Err(e) = self.cache.record(&chain, &id) {
                warn!("failed to record cache for {}: {e}", chain.short());
            }
            debug!("layer {} at chain {}", id.short(), chain.short());
            lower_dirs.push(self.layers.data_dir(&id));
            layer.id = id;
            session.outcomes.push(outcome);
        }

        info!("exec all build instructions success");
        Ok(())
    }

    fn cache_key(&self, layer: &Layer, context: &Path) -> Result<String, CoreError> {
        match layer.layer_type {
            LayerType::Run | LayerType::Cmd => {
                Ok(command_cache_key(layer.layer_type, &layer.value))
            }
            LayerType::Copy => {
                let (src, dst) = copy_operands(layer)?;
                let source = resolve_copy_source(context, src)?;
                let digest = content_digest(&source)?;
                let destination = copy_destination(&source, dst)?;
                Ok(copy_cache_key(&digest, &destination.to_string_lossy()))
            }
            LayerType::Base | LayerType::RegistrySnapshot => Err(CoreError::Validation(
                format!("{} is not an executable instruction", layer.layer_type),
            )),
        }
    }

    fn realize(
        &self,
        layer: &Layer,
        key: &str,
        context: &Path,
        lower_dirs: &[PathBuf],
    ) -> Result<LayerId, CoreError> {
        if layer.layer_type == LayerType::Copy {
            self.realize_copy(layer, key, context)
        } else {
            self.realize_command(layer, context, lower_dirs)
        }
    }

    fn realize_copy(&self, layer: &Layer, key: &str, context: &Path) -> Result<LayerId, CoreError> {
        let (src, dst) = copy_operands(layer)?;
        let source = resolve_copy_source(context, src)?;
        let scratch = tempfile::Builder::new()
            .prefix("copy-")
            .tempdir_in(self.staging)?;
        let target = scratch.path().join(copy_destination(&source, dst)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_tree(&source, &target)?;

        let id = self.layers.register(scratch.path())?;
        if let Err(e) = self.layers.set_metadata(&id, CACHE_ID_KEY, key.as_bytes()) {
            warn!("set cache id failed for layer {}: {e}", id.short());
        }
        Ok(id)
    }

    fn realize_command(
        &self,
        layer: &Layer,
        context: &Path,
        lower_dirs: &[PathBuf],
    ) -> Result<LayerId, CoreError> {
        let scratch = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(self.staging)?;
        let upper = scratch.path().join("upper");
        fs::create_dir_all(&upper)?;

        let request = ExecRequest {
            layer_type: layer.layer_type,
            command: layer.value.clone(),
            lower_dirs: lower_dirs.to_vec(),
            upper_dir: upper.clone(),
            context_dir: context.to_path_buf(),
        };
        self.executor
            .execute(&request)
            .map_err(|e| CoreError::Execution {
                instruction: format!("{} {}", layer.layer_type, layer.value),
                reason: e.to_string(),
            })?;

        Ok(self.layers.register(&upper)?)
    }
}

fn copy_operands(layer: &Layer) -> Result<(&str, &str), CoreError> {
    layer.copy_operands().ok_or_else(|| {
        CoreError::Validation(format!("malformed COPY instruction '{}'", layer.value))
    })
}

/// Where a COPY source lands inside its layer: `<dst>/<basename(src)>`.
fn copy_destination(source: &Path, dst: &str) -> Result<PathBuf, CoreError> {
    let name = source.file_name().ok_or_else(|| {
        CoreError::Validation(format!("COPY source {} has no name", source.display()))
    })?;
    Ok(clean_relative(dst)?.join(name))
}

/// Copy a file, symlink, or directory tree, keeping permissions. Special
/// files are skipped.
fn copy_tree(src: &Path, dst: &Path) -> Result<(), CoreError> {
    let meta = fs::symlink_metadata(src)?;
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        std::os::unix::fs::symlink(fs::read_link(src)?, dst)?;
    } else if file_type.is_dir() {
        fs::create_dir_all(dst)?;
        let mut entries = fs::read_dir(src)?.collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(fs::DirEntry::file_name);
        for entry in entries {
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        fs::set_permissions(dst, meta.permissions())?;
    } else if file_type.is_file() {
        fs::copy(src, dst)?;
    } else {
        warn!("skipping special file {}", src.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StoreProbe;
    use crate::config::{BuildMode, BuildOptions};
    use crate::context::BuildContext;
    use std::sync::Arc;
    use stratum_runtime::mock::MockExecutor;
    use stratum_store::{FileChainCache, StoreLayout};

    struct Fixture {
        _dir: tempfile::TempDir,
        context: PathBuf,
        layout: StoreLayout,
        layers: LayerStore,
        cache: Arc<FileChainCache>,
        probe: StoreProbe,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let context = dir.path().join("ctx");
        fs::create_dir_all(context.join("charts")).unwrap();
        fs::write(context.join("Clusterfile"), "kind: Cluster\n").unwrap();
        fs::write(context.join("charts/app.yaml"), "replicas: 1\n").unwrap();
        let layout = StoreLayout::new(dir.path().join("root"));
        layout.initialize().unwrap();
        let layers = LayerStore::new(layout.clone());
        let cache = Arc::new(FileChainCache::open(&layout).unwrap());
        let probe = StoreProbe::new(cache.clone(), LayerStore::new(layout.clone()));
        Fixture {
            _dir: dir,
            context,
            layout,
            layers,
            cache,
            probe,
        }
    }

    fn session(fx: &Fixture, instructions: &[(LayerType, &str)], options: BuildOptions) -> BuildSession {
        let ctx = BuildContext {
            dir: fx.context.clone(),
            kubefile: fx.context.join("Kubefile"),
        };
        let mut s = BuildSession::new("app:v1", ctx, options);
        s.new_layers = instructions
            .iter()
            .map(|(t, v)| Layer::new(*t, *v))
            .collect();
        s
    }

    fn run(fx: &Fixture, exec: &MockExecutor, s: &mut BuildSession) -> Result<(), CoreError> {
        let staging = fx.layout.staging_dir();
        LayerEngine::new(&fx.layers, fx.cache.as_ref(), &fx.probe, exec, &staging).execute(s)
    }

    #[test]
    fn copy_lands_under_destination() {
        let fx = fixture();
        let exec = MockExecutor::new();
        let mut s = session(
            &fx,
            &[(LayerType::Copy, "Clusterfile etc"), (LayerType::Copy, "charts")],
            BuildOptions::default(),
        );
        run(&fx, &exec, &mut s).unwrap();

        let first = fx.layers.data_dir(&s.new_layers[0].id);
        assert_eq!(
            fs::read_to_string(first.join("etc/Clusterfile")).unwrap(),
            "kind: Cluster\n"
        );
        let second = fx.layers.data_dir(&s.new_layers[1].id);
        assert!(second.join("charts/app.yaml").is_file());
        assert_eq!(exec.execution_count(), 0);
        assert!(fx
            .layers
            .get_metadata(&s.new_layers[0].id, CACHE_ID_KEY)
            .unwrap()
            .is_some());
    }

    #[test]
    fn copy_cache_id_covers_content_and_destination() {
        let fx = fixture();
        let exec = MockExecutor::new();
        let mut s = session(
            &fx,
            &[(LayerType::Copy, "charts/app.yaml manifests")],
            BuildOptions::default(),
        );
        run(&fx, &exec, &mut s).unwrap();

        let digest = content_digest(&fx.context.join("charts/app.yaml")).unwrap();
        let expected = copy_cache_key(&digest, "manifests/app.yaml");
        assert_eq!(
            fx.layers
                .get_metadata(&s.new_layers[0].id, CACHE_ID_KEY)
                .unwrap(),
            Some(expected.into_bytes())
        );
    }

    #[test]
    fn run_sees_earlier_layers_as_lower_dirs() {
        let fx = fixture();
        let exec = MockExecutor::new();
        let mut s = session(
            &fx,
            &[
                (LayerType::Copy, "charts"),
                (LayerType::Run, "kubectl apply -f charts"),
                (LayerType::Cmd, "kubectl get pods"),
            ],
            BuildOptions::default(),
        );
        run(&fx, &exec, &mut s).unwrap();

        let records = exec.executions();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].lower_dirs, vec![fx.layers.data_dir(&s.new_layers[0].id)]);
        assert_eq!(records[1].lower_dirs.len(), 2);
        assert!(s.new_layers.iter().all(Layer::is_realized));
    }

    #[test]
    fn layer_limit_checked_before_execution() {
        let fx = fixture();
        let exec = MockExecutor::new();
        let instructions: Vec<(LayerType, &str)> =
            (0..=MAX_LAYER_DEPTH).map(|_| (LayerType::Run, "true")).collect();
        let mut s = session(&fx, &instructions, BuildOptions::default());
        assert!(matches!(
            run(&fx, &exec, &mut s),
            Err(CoreError::LayerLimit { count: 129, max: 128 })
        ));
        assert_eq!(exec.execution_count(), 0);

        let mut s = session(&fx, &[(LayerType::Run, "true")], BuildOptions::default());
        s.base_layers = vec![Layer::new(LayerType::Copy, "x"); MAX_LAYER_DEPTH];
        assert!(run(&fx, &exec, &mut s).is_err());
        assert!(check_layer_limit(MAX_LAYER_DEPTH - 1, 1).is_ok());
    }

    #[test]
    fn strict_mode_aborts_on_failure() {
        let fx = fixture();
        let exec = MockExecutor::failing_on(&["helm"]);
        let mut s = session(
            &fx,
            &[
                (LayerType::Run, "helm install app"),
                (LayerType::Run, "kubectl get pods"),
            ],
            BuildOptions::default(),
        );
        let err = run(&fx, &exec, &mut s).unwrap_err();
        assert!(matches!(err, CoreError::Execution { .. }));
        assert!(!exec.executed("kubectl get pods"));
    }

    #[test]
    fn lite_mode_skips_failed_layer() {
        let fx = fixture();
        let exec = MockExecutor::failing_on(&["helm"]);
        let options = BuildOptions {
            mode: BuildMode::Lite,
            no_cache: false,
        };
        let mut s = session(
            &fx,
            &[
                (LayerType::Run, "kubectl create ns a"),
                (LayerType::Run, "helm install app"),
                (LayerType::Run, "kubectl get pods"),
            ],
            options,
        );
        run(&fx, &exec, &mut s).unwrap();

        assert!(s.new_layers[0].is_realized());
        assert!(!s.new_layers[1].is_realized());
        assert!(s.new_layers[2].is_realized());
        assert_eq!(
            s.outcomes,
            vec![LayerOutcome::Executed, LayerOutcome::Skipped, LayerOutcome::Executed]
        );
        let last = exec.executions().pop().unwrap();
        assert_eq!(last.lower_dirs, vec![fx.layers.data_dir(&s.new_layers[0].id)]);
    }

    #[test]
    fn lite_mode_does_not_excuse_copy_errors() {
        let fx = fixture();
        let exec = MockExecutor::new();
        let options = BuildOptions {
            mode: BuildMode::Lite,
            no_cache: false,
        };
        let mut s = session(&fx, &[(LayerType::Copy, "missing.yaml")], options);
        assert!(matches!(
            run(&fx, &exec, &mut s),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn second_run_hits_cache_everywhere() {
        let fx = fixture();
        let instructions = [
            (LayerType::Copy, "charts"),
            (LayerType::Run, "kubectl apply -f charts"),
        ];
        let exec = MockExecutor::new();
        let mut first = session(&fx, &instructions, BuildOptions::default());
        run(&fx, &exec, &mut first).unwrap();
        let mut second = session(&fx, &instructions, BuildOptions::default());
        run(&fx, &exec, &mut second).unwrap();

        assert_eq!(exec.execution_count(), 1);
        assert_eq!(second.outcomes, vec![LayerOutcome::CacheHit; 2]);
        assert_eq!(first.new_layers, second.new_layers);
    }

    #[test]
    fn miss_disables_cache_for_later_layers() {
        let fx = fixture();
        let exec = MockExecutor::new();
        let mut first = session(&fx, &[(LayerType::Copy, "charts")], BuildOptions::default());
        run(&fx, &exec, &mut first).unwrap();

        let mut second = session(
            &fx,
            &[
                (LayerType::Run, "kubectl create ns b"),
                (LayerType::Copy, "charts"),
            ],
            BuildOptions::default(),
        );
        run(&fx, &exec, &mut second).unwrap();
        assert_eq!(second.outcomes, vec![LayerOutcome::Executed; 2]);
        assert_eq!(second.new_layers[1].id, first.new_layers[0].id);
    }

    #[test]
    fn copy_reused_through_cache_id_on_new_lineage() {
        let fx = fixture();
        let exec = MockExecutor::new();
        let mut first = session(
            &fx,
            &[
                (LayerType::Run, "kubectl create ns a"),
                (LayerType::Copy, "charts"),
            ],
            BuildOptions::default(),
        );
        run(&fx, &exec, &mut first).unwrap();

        let mut second = session(&fx, &[(LayerType::Copy, "charts")], BuildOptions::default());
        run(&fx, &exec, &mut second).unwrap();
        assert_eq!(second.outcomes, vec![LayerOutcome::CacheHit]);
        assert_eq!(second.new_layers[0].id, first.new_layers[1].id);
    }

    #[test]
    fn no_cache_reexecutes_with_same_digests() {
        let fx = fixture();
        let instructions = [(LayerType::Run, "kubectl apply -f charts")];
        let exec = MockExecutor::new();
        let mut first = session(&fx, &instructions, BuildOptions::default());
        run(&fx, &exec, &mut first).unwrap();
        let options = BuildOptions {
            mode: BuildMode::Local,
            no_cache: true,
        };
        let mut second = session(&fx, &instructions, options);
        run(&fx, &exec, &mut second).unwrap();

        assert_eq!(exec.execution_count(), 2);
        assert_eq!(second.outcomes, vec![LayerOutcome::Executed]);
        assert_eq!(first.new_layers[0].id, second.new_layers[0].id);
    }

    #[test]
    fn base_chain_ignores_unrealized_layers() {
        let mut realized = Layer::new(LayerType::Copy, "a");
        realized.id = LayerId::new("aa");
        let skipped = Layer::new(LayerType::Run, "b");
        assert_eq!(
            base_chain_id(&[realized.clone(), skipped]),
            base_chain_id(&[realized])
        );
        assert_eq!(base_chain_id(&[]), ChainId::default());
    }
}
