use crate::context::read_copy_source;
use crate::session::BuildSession;
use crate::CoreError;
use std::path::Path;
use stratum_schema::{rewrite_clusterfile_image, LayerType, SchemaError, CLUSTERFILE_NAME};
use stratum_store::ImageStore;
use tracing::{debug, info};

/// Find the Clusterfile for the image being built.
///
/// In order: a `COPY Clusterfile ...` source from the context, the parent
/// image's annotation, and for scratch builds `etc/Clusterfile` in the
/// context.
pub fn resolve_clusterfile(session: &BuildSession, images: &ImageStore) -> Result<String, CoreError> {
    let context = &session.context.dir;

    for layer in &session.new_layers {
        if layer.layer_type != LayerType::Copy {
            continue;
        }
        let Some((src, _)) = layer.copy_operands() else {
            continue;
        };
        if Path::new(src).file_name().and_then(|n| n.to_str()) != Some(CLUSTERFILE_NAME) {
            continue;
        }
        if let Some(raw) = read_copy_source(context, src)? {
            debug!("clusterfile from context {src}");
            return Ok(raw);
        }
    }

    if !session.image.is_scratch() {
        if let Some(base) = session.image.base_name() {
            let parent = images.get_by_name(base)?;
            if let Some(raw) = parent.clusterfile() {
                debug!("clusterfile from base image {base}");
                return Ok(raw.to_owned());
            }
        }
        return Err(CoreError::MissingClusterfile(format!(
            "no COPY {CLUSTERFILE_NAME} in the kubefile and the base image carries none"
        )));
    }

    let staged = context.join("etc").join(CLUSTERFILE_NAME);
    if staged.is_file() {
        debug!("clusterfile from {}", staged.display());
        return Ok(std::fs::read_to_string(staged)?);
    }
    Err(CoreError::MissingClusterfile(format!(
        "scratch build has no COPY {CLUSTERFILE_NAME} and no {}",
        staged.display()
    )))
}

/// Embed the Clusterfile, join base and new layers, compute the image id and
/// save the image under the session's name.
pub fn finalize_metadata(session: &mut BuildSession, images: &ImageStore) -> Result<(), CoreError> {
    let raw = resolve_clusterfile(session, images)?;
    let clusterfile =
        rewrite_clusterfile_image(&raw, &session.name).map_err(SchemaError::from)?;

    let mut image = session.image.clone();
    image.set_clusterfile(clusterfile);
    image.layers = session
        .base_layers
        .iter()
        .chain(session.new_layers.iter())
        .cloned()
        .collect();
    image.id = image.compute_id()?;

    images.save(&image, &session.name)?;
    info!("update image {} to image metadata success ({})", session.name, image.id.short());
    session.image = image;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildOptions;
    use crate::context::BuildContext;
    use std::fs;
    use stratum_schema::{parse_kubefile_str, ClusterDocument, Image, Layer, LayerId};
    use stratum_store::StoreLayout;

    const CLUSTERFILE: &str = "apiVersion: stratum.dev/v1\nkind: Cluster\nspec:\n  image: old\n";

    fn setup(kubefile: &str) -> (tempfile::TempDir, BuildSession, ImageStore) {
        let dir = tempfile::tempdir().unwrap();
        let ctx_dir = dir.path().join("ctx");
        fs::create_dir_all(&ctx_dir).unwrap();
        let layout = StoreLayout::new(dir.path().join("root"));
        layout.initialize().unwrap();

        let image = parse_kubefile_str(kubefile).unwrap();
        let ctx = BuildContext {
            dir: ctx_dir.clone(),
            kubefile: ctx_dir.join("Kubefile"),
        };
        let mut session = BuildSession::new("app:v1", ctx, BuildOptions::default());
        session.new_layers = image.layers[1..].to_vec();
        session.image = image;
        (dir, session, ImageStore::new(layout))
    }

    fn save_parent(images: &ImageStore, name: &str, clusterfile: Option<&str>) -> Image {
        let mut layer = Layer::new(LayerType::Copy, "rootfs .");
        layer.id = LayerId::new("cd".repeat(32));
        let mut image = Image::from_layers(vec![layer]);
        if let Some(cf) = clusterfile {
            image.set_clusterfile(cf.to_owned());
        }
        image.id = image.compute_id().unwrap();
        images.save(&image, name).unwrap();
        image
    }

    #[test]
    fn context_copy_wins_over_base_annotation() {
        let (_dir, session, images) = setup("FROM kube:v1\nCOPY Clusterfile etc\n");
        fs::write(session.context.dir.join("Clusterfile"), "from: context\n").unwrap();
        save_parent(&images, "kube:v1", Some("from: base\n"));
        assert_eq!(resolve_clusterfile(&session, &images).unwrap(), "from: context\n");
    }

    #[test]
    fn base_annotation_used_without_context_copy() {
        let (_dir, session, images) = setup("FROM kube:v1\nCOPY charts .\n");
        save_parent(&images, "kube:v1", Some("from: base\n"));
        assert_eq!(resolve_clusterfile(&session, &images).unwrap(), "from: base\n");
    }

    #[test]
    fn scratch_uses_staged_default() {
        let (_dir, session, images) = setup("FROM scratch\nCOPY charts .\n");
        let etc = session.context.dir.join("etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join("Clusterfile"), "from: staged\n").unwrap();
        assert_eq!(resolve_clusterfile(&session, &images).unwrap(), "from: staged\n");
    }

    #[test]
    fn unresolvable_clusterfile_is_an_error() {
        let (_dir, session, images) = setup("FROM scratch\nRUN true\n");
        assert!(matches!(
            resolve_clusterfile(&session, &images),
            Err(CoreError::MissingClusterfile(_))
        ));

        let (_dir, session, images) = setup("FROM kube:v1\nRUN true\n");
        save_parent(&images, "kube:v1", None);
        assert!(matches!(
            resolve_clusterfile(&session, &images),
            Err(CoreError::MissingClusterfile(_))
        ));
    }

    #[test]
    fn finalize_joins_layers_and_saves() {
        let (_dir, mut session, images) = setup("FROM kube:v1\nRUN kubectl apply -f x\n");
        let parent = save_parent(&images, "kube:v1", Some(CLUSTERFILE));
        session.base_layers = parent.layers.clone();
        session.new_layers[0].id = LayerId::new("ef".repeat(32));

        finalize_metadata(&mut session, &images).unwrap();

        let saved = images.get_by_name("app:v1").unwrap();
        assert_eq!(saved, session.image);
        assert_eq!(saved.layers.len(), 2);
        assert_eq!(saved.layers[0], parent.layers[0]);
        assert_eq!(saved.layers[1].layer_type, LayerType::Run);
        let doc = ClusterDocument::parse(saved.clusterfile().unwrap()).unwrap();
        assert_eq!(doc.spec.image, "app:v1");
        assert_eq!(saved.id, saved.compute_id().unwrap());
    }
}
