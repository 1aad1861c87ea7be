//! End-to-end generation against the template tree in `tests/fixtures`

use assetgen_core::{
    AssetPatchSpec, ClusterFlavor, ControllerConfig, CoreError, DirTemplateStore, DriverConfig,
    FlavorSet, GuestConfig, MemoryTemplateStore, SidecarSpec, TemplateStore,
};
use assetgen_engine::{
    AssetGenerator, EngineError, GeneratedAssetBundle, RenderOptions, Side, generate,
};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::BTreeSet;

fn fixtures_path() -> &'static str {
    concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures")
}

fn store() -> DirTemplateStore {
    DirTemplateStore::new(format!("{}/assets", fixtures_path())).unwrap()
}

fn config() -> DriverConfig {
    DriverConfig::from_file(format!("{}/driver.yaml", fixtures_path())).unwrap()
}

/// Parse a generated asset; the provenance header is plain YAML comments
fn asset(bundle: &GeneratedAssetBundle, side: Side, name: &str) -> Value {
    let bytes = bundle
        .asset(side, name)
        .unwrap_or_else(|| panic!("missing {} asset {}", side, name));
    serde_yaml::from_slice(bytes).unwrap()
}

fn text(bundle: &GeneratedAssetBundle, side: Side, name: &str) -> String {
    String::from_utf8(bundle.asset(side, name).unwrap().to_vec()).unwrap()
}

fn container_names(workload: &Value) -> Vec<String> {
    workload["spec"]["template"]["spec"]["containers"]
        .as_sequence()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap().to_string())
        .collect()
}

fn container<'v>(workload: &'v Value, name: &str) -> &'v Value {
    workload["spec"]["template"]["spec"]["containers"]
        .as_sequence()
        .unwrap()
        .iter()
        .find(|c| c["name"] == name)
        .unwrap_or_else(|| panic!("no container {}", name))
}

fn args(container: &Value) -> Vec<&str> {
    container["args"]
        .as_sequence()
        .unwrap()
        .iter()
        .map(|a| a.as_str().unwrap())
        .collect()
}

mod standalone {
    use super::*;

    #[test]
    fn test_asset_names() {
        let bundle = generate(ClusterFlavor::Standalone, &config(), &store()).unwrap();

        assert_eq!(
            bundle.names(Side::Controller).collect::<Vec<_>>(),
            vec![
                "controller.yaml",
                "controller_metrics_service.yaml",
                "controller_metrics_servicemonitor.yaml",
                "controller_pdb.yaml",
            ]
        );
        assert_eq!(
            bundle.names(Side::Guest).collect::<Vec<_>>(),
            vec![
                "csidriver.yaml",
                "node.yaml",
                "node_kube_rbac_proxy_binding.yaml",
                "node_kube_rbac_proxy_role.yaml",
                "node_metrics_service.yaml",
                "node_metrics_servicemonitor.yaml",
                "node_privileged_rbac.yaml",
                "provisioner_role.yaml",
            ]
        );
    }

    #[test]
    fn test_controller_deployment() {
        let bundle = generate(ClusterFlavor::Standalone, &config(), &store()).unwrap();
        let deployment = asset(&bundle, Side::Controller, "controller.yaml");

        assert_eq!(deployment["metadata"]["name"], "test-csi-driver-controller");
        assert_eq!(
            container_names(&deployment),
            vec![
                "csi-driver",
                "driver-kube-rbac-proxy",
                "csi-provisioner",
                "provisioner-m-kube-rbac-proxy",
                "csi-attacher",
                "attacher-m-kube-rbac-proxy",
                "csi-liveness-probe",
            ]
        );

        let driver = container(&deployment, "csi-driver");
        assert_eq!(driver["ports"][0]["containerPort"], 10301);
        assert!(driver.get("env").is_none());

        let provisioner = container(&deployment, "csi-provisioner");
        assert_eq!(
            args(provisioner),
            vec![
                "--csi-address=$(ADDRESS)",
                "--leader-election",
                "--http-endpoint=localhost:8202",
                "--v=${LOG_LEVEL}",
                "--extra-create-metadata=true",
            ]
        );

        let liveness = container(&deployment, "csi-liveness-probe");
        assert!(args(liveness).contains(&"--health-port=10301"));
    }

    #[test]
    fn test_sidecar_metrics_ports_are_allocated_in_order() {
        let bundle = generate(ClusterFlavor::Standalone, &config(), &store()).unwrap();
        let deployment = asset(&bundle, Side::Controller, "controller.yaml");

        let provisioner_proxy = container(&deployment, "provisioner-m-kube-rbac-proxy");
        assert_eq!(
            args(provisioner_proxy),
            vec![
                "--secure-listen-address=0.0.0.0:9202",
                "--upstream=http://127.0.0.1:8202/",
            ]
        );
        let attacher_proxy = container(&deployment, "attacher-m-kube-rbac-proxy");
        assert_eq!(attacher_proxy["ports"][0]["containerPort"], 9203);
        let attacher = container(&deployment, "csi-attacher");
        assert!(args(attacher).contains(&"--http-endpoint=localhost:8203"));

        let service = asset(&bundle, Side::Controller, "controller_metrics_service.yaml");
        let ports: Vec<_> = service["spec"]["ports"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|p| (p["name"].as_str().unwrap(), p["port"].as_u64().unwrap()))
            .collect();
        assert_eq!(
            ports,
            vec![("provisioner-m", 9202), ("attacher-m", 9203), ("driver-m", 9201)]
        );

        let monitor = asset(&bundle, Side::Controller, "controller_metrics_servicemonitor.yaml");
        let endpoints = monitor["spec"]["endpoints"].as_sequence().unwrap();
        assert_eq!(endpoints.len(), 3);
        assert_eq!(endpoints[2]["port"], "driver-m");
        assert_eq!(
            endpoints[0]["tlsConfig"]["serverName"],
            "test-csi-driver-controller-metrics.openshift-cluster-csi-drivers.svc"
        );
    }

    #[test]
    fn test_node_daemonset() {
        let bundle = generate(ClusterFlavor::Standalone, &config(), &store()).unwrap();
        let daemonset = asset(&bundle, Side::Guest, "node.yaml");

        assert_eq!(
            container_names(&daemonset),
            vec![
                "csi-driver",
                "kube-rbac-proxy-8301",
                "csi-node-driver-registrar",
                "csi-liveness-probe",
            ]
        );
        let registrar = container(&daemonset, "csi-node-driver-registrar");
        assert_eq!(
            args(registrar),
            vec![
                "--csi-address=$(ADDRESS)",
                concat!(
                    "--kubelet-registration-path=",
                    "/var/lib/kubelet/plugins/test.csi.example.com/csi.sock",
                ),
                "--http-endpoint=127.0.0.1:10302",
            ]
        );
        assert!(args(container(&daemonset, "csi-liveness-probe")).contains(&"--health-port=10300"));

        // guest asset patch applied for all flavors
        assert_eq!(
            daemonset["spec"]["template"]["spec"]["tolerations"][0]["operator"],
            "Exists"
        );

        let service = asset(&bundle, Side::Guest, "node_metrics_service.yaml");
        assert_eq!(service["spec"]["ports"][0]["port"], 9301);
        assert_eq!(service["spec"]["ports"][0]["name"], "driver-m");
    }

    #[test]
    fn test_controller_sidecar_guest_assets() {
        let bundle = generate(ClusterFlavor::Standalone, &config(), &store()).unwrap();

        assert!(bundle.asset(Side::Controller, "provisioner_role.yaml").is_none());
        let role = asset(&bundle, Side::Guest, "provisioner_role.yaml");
        assert_eq!(role["metadata"]["name"], "test-external-provisioner-role");

        let header = text(&bundle, Side::Guest, "provisioner_role.yaml");
        assert!(header.contains(
            "# Loaded from common/rbac/provisioner_role.yaml\n\
             #   because it's needed by controller sidecar common/sidecars/provisioner.yaml\n"
        ));
    }

    #[test]
    fn test_multi_document_static_asset() {
        let bundle = generate(ClusterFlavor::Standalone, &config(), &store()).unwrap();
        let rbac = text(&bundle, Side::Guest, "node_privileged_rbac.yaml");

        assert!(rbac.contains("\n---\n"));
        let documents: Vec<Value> = serde_yaml::Deserializer::from_str(&rbac)
            .map(|de| Value::deserialize(de).unwrap())
            .collect();
        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0]["kind"], "ClusterRole");
        assert_eq!(documents[0]["metadata"]["name"], "test-privileged-role");
        assert_eq!(documents[1]["kind"], "ClusterRoleBinding");
        assert_eq!(documents[1]["metadata"]["name"], "test-node-privileged-binding");
        assert_eq!(documents[1]["roleRef"]["name"], "test-privileged-role");
    }

    #[test]
    fn test_provenance_header() {
        let bundle = generate(ClusterFlavor::Standalone, &config(), &store()).unwrap();
        let csidriver = text(&bundle, Side::Guest, "csidriver.yaml");

        insta::assert_snapshot!(csidriver, @r#"
        # Generated file. Do not edit. Update using "make update".
        #
        # Loaded from overlays/test/csidriver.yaml
        #

        apiVersion: storage.k8s.io/v1
        kind: CSIDriver
        metadata:
          name: test.csi.example.com
        spec:
          attachRequired: false
        "#);

        let deployment = text(&bundle, Side::Controller, "controller.yaml");
        assert!(deployment.contains("# Loaded from base/controller.yaml\n"));
        assert!(deployment.contains("# Merged overlays/test/controller_add_driver.yaml\n"));
        assert!(deployment.contains("#   with LIVENESS_PROBE_PORT=10301\n"));
        assert!(deployment.contains(
            "# Added arguments to container csi-provisioner: --extra-create-metadata=true\n"
        ));
    }

    #[test]
    fn test_render_without_provenance() {
        let config = config();
        let store = store();
        let bundle = AssetGenerator::new(ClusterFlavor::Standalone, &config, &store)
            .with_render_options(RenderOptions { provenance: false })
            .generate()
            .unwrap();

        assert!(bundle
            .controller
            .values()
            .chain(bundle.guest.values())
            .all(|bytes| !bytes.starts_with(b"#")));
    }
}

mod hypershift {
    use super::*;

    #[test]
    fn test_no_service_monitor_without_monitoring_rbac() {
        let bundle = generate(ClusterFlavor::HyperShift, &config(), &store()).unwrap();

        assert_eq!(
            bundle.names(Side::Controller).collect::<Vec<_>>(),
            vec!["controller.yaml", "controller_metrics_service.yaml"]
        );
        // the guest side still exposes node metrics
        assert!(bundle
            .asset(Side::Guest, "node_metrics_servicemonitor.yaml")
            .is_some());
    }

    #[test]
    fn test_flavor_gated_patches() {
        let bundle = generate(ClusterFlavor::HyperShift, &config(), &store()).unwrap();
        let deployment = asset(&bundle, Side::Controller, "controller.yaml");

        let driver = container(&deployment, "csi-driver");
        assert_eq!(driver["env"][0]["name"], "KUBECONFIG");
        assert_eq!(
            deployment["spec"]["template"]["spec"]["volumes"][0]["name"],
            "hosted-kubeconfig"
        );

        let provisioner = container(&deployment, "csi-provisioner");
        assert_eq!(
            args(provisioner).last(),
            Some(&"--kubeconfig=/etc/hosted-kubernetes/kubeconfig")
        );
    }

    #[test]
    fn test_standalone_only_assets_are_skipped() {
        let bundle = generate(ClusterFlavor::HyperShift, &config(), &store()).unwrap();
        assert!(bundle.asset(Side::Controller, "controller_pdb.yaml").is_none());
    }
}

mod properties {
    use super::*;

    #[test]
    fn test_generation_is_deterministic() {
        let config = config();
        let dir = store();
        let memory = MemoryTemplateStore::from_dir(format!("{}/assets", fixtures_path())).unwrap();

        for flavor in ClusterFlavor::ALL {
            let first = generate(flavor, &config, &dir).unwrap();
            let second = generate(flavor, &config, &dir).unwrap();
            let from_memory = generate(flavor, &config, &memory).unwrap();
            assert_eq!(first, second);
            assert_eq!(first, from_memory);
        }
    }

    #[test]
    fn test_only_runtime_placeholders_remain() {
        let bundle = generate(ClusterFlavor::Standalone, &config(), &store()).unwrap();

        let tokens: BTreeSet<_> = bundle
            .unresolved_placeholders()
            .into_iter()
            .map(|p| p.token)
            .collect();
        let expected: BTreeSet<_> = [
            "${ATTACHER_IMAGE}",
            "${DRIVER_IMAGE}",
            "${LIVENESS_PROBE_IMAGE}",
            "${LOG_LEVEL}",
            "${NODE_DRIVER_REGISTRAR_IMAGE}",
            "${PROVISIONER_IMAGE}",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(tokens, expected);

        // generator-owned tokens are always resolved
        for p in bundle.unresolved_placeholders() {
            assert!(!p.token.contains("PORT"), "{} left in {}", p.token, p.asset);
            assert!(!p.token.contains("PREFIX"), "{} left in {}", p.token, p.asset);
        }
    }

    #[test]
    fn test_store_closure() {
        let dir = store();
        let seen = std::sync::Mutex::new(Vec::new());
        let recording = |name: &str| {
            seen.lock().unwrap().push(name.to_string());
            dir.resolve(name)
        };

        generate(ClusterFlavor::Standalone, &config(), &recording).unwrap();

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen[0], "base/controller.yaml");
        assert!(seen.iter().any(|n| n == "common/metrics/service_monitor_add_port.yaml.patch"));
    }
}

mod scenarios {
    use super::*;

    const BASE: &str = r#"
kind: Deployment
metadata:
  name: ${ASSET_PREFIX}-controller
spec:
  template:
    spec:
      containers: []
"#;

    const DRIVER: &str = r#"
spec:
  template:
    spec:
      containers:
        - name: csi-driver
          image: driver
"#;

    const SIDECAR: &str = r#"
spec:
  template:
    spec:
      containers:
        - name: csi-resizer
          args: [--csi-address=$(ADDRESS)]
"#;

    const NODE: &str = r#"
kind: DaemonSet
spec:
  template:
    spec:
      containers: []
"#;

    const RBAC_PROXY: &str = r#"
spec:
  template:
    spec:
      containers:
        - name: ${PORT_NAME}-kube-rbac-proxy
          args: ["--listen=${EXPOSED_METRICS_PORT}", "--upstream=${LOCAL_METRICS_PORT}"]
"#;

    const SNAPSHOTTER: &str = r#"
spec:
  template:
    spec:
      containers:
        - name: csi-snapshotter
"#;

    const LABELS: &str = r#"
metadata:
  labels:
    team: storage
"#;

    fn minimal_store() -> MemoryTemplateStore {
        MemoryTemplateStore::new().with_templates([
            ("base/controller.yaml", BASE),
            ("base/node.yaml", NODE),
            ("base/controller_metrics_service.yaml", "kind: Service\nspec:\n  ports: []\n"),
            (
                "base/controller_metrics_servicemonitor.yaml",
                "kind: ServiceMonitor\nspec:\n  endpoints: []\n",
            ),
            (
                "common/metrics/service_add_port.yaml",
                "spec:\n  ports:\n    - name: ${PORT_NAME}\n",
            ),
            (
                "common/metrics/service_monitor_add_port.yaml.patch",
                "- op: add\n  path: /spec/endpoints/-\n  value:\n    port: ${PORT_NAME}\n",
            ),
            ("driver.yaml", DRIVER),
            ("node_driver.yaml", "{}\n"),
            ("resizer.yaml", SIDECAR),
            ("labels.yaml", LABELS),
        ])
    }

    fn minimal_config() -> DriverConfig {
        let mut controller = ControllerConfig::new("driver.yaml");
        controller.sidecars.push(SidecarSpec::new("resizer.yaml"));
        controller.asset_patches.push(AssetPatchSpec::new(
            "controller.yaml",
            "labels.yaml",
            FlavorSet::all(),
        ));
        DriverConfig {
            asset_prefix: "mini-csi-driver".into(),
            asset_short_prefix: "mini".into(),
            driver_name: "mini.csi.example.com".into(),
            controller,
            guest: GuestConfig::new("node_driver.yaml"),
            layout: Default::default(),
        }
    }

    #[test]
    fn test_plain_sidecar_and_asset_patch() {
        let bundle =
            generate(ClusterFlavor::Standalone, &minimal_config(), &minimal_store()).unwrap();
        let deployment = asset(&bundle, Side::Controller, "controller.yaml");

        assert_eq!(container_names(&deployment), vec!["csi-driver", "csi-resizer"]);
        assert_eq!(deployment["metadata"]["labels"]["team"], "storage");
        assert_eq!(deployment["metadata"]["name"], "mini-csi-driver-controller");

        // no metrics anywhere: empty service, no node monitoring objects
        let service = asset(&bundle, Side::Controller, "controller_metrics_service.yaml");
        assert_eq!(service["spec"]["ports"].as_sequence().unwrap().len(), 0);
        assert_eq!(bundle.names(Side::Guest).collect::<Vec<_>>(), vec!["node.yaml"]);
    }

    #[test]
    fn test_patch_of_missing_asset() {
        let mut config = minimal_config();
        config.controller.asset_patches = vec![AssetPatchSpec::new(
            "storageclass.yaml",
            "labels.yaml",
            FlavorSet::all(),
        )];

        let err = generate(ClusterFlavor::Standalone, &config, &minimal_store()).unwrap_err();

        assert!(matches!(
            err.root(),
            EngineError::AssetNotFoundForPatch { asset, patch }
                if asset == "storageclass.yaml" && patch == "labels.yaml"
        ));
        assert!(err.to_string().contains("storageclass.yaml"));
    }

    #[test]
    fn test_patch_of_missing_asset_for_other_flavor_is_ignored() {
        let mut config = minimal_config();
        config.controller.asset_patches = vec![AssetPatchSpec::new(
            "storageclass.yaml",
            "labels.yaml",
            FlavorSet::only(ClusterFlavor::HyperShift),
        )];

        assert!(generate(ClusterFlavor::Standalone, &config, &minimal_store()).is_ok());
    }

    #[test]
    fn test_missing_template() {
        let mut config = minimal_config();
        config.controller.sidecars.push(SidecarSpec::new("snapshotter.yaml"));

        let err = generate(ClusterFlavor::Standalone, &config, &minimal_store()).unwrap_err();

        assert!(matches!(
            err.root(),
            EngineError::Core(CoreError::TemplateNotFound { name }) if name == "snapshotter.yaml"
        ));
        insta::assert_snapshot!(
            err.to_string(),
            @"controller asset 'controller.yaml': patch 'snapshotter.yaml': template not found: snapshotter.yaml"
        );
    }

    #[test]
    fn test_merge_type_mismatch_names_the_path() {
        const BAD_ARGS: &str = r#"
spec:
  template:
    spec:
      containers:
        - name: csi-driver
          image: [a]
"#;
        let store = minimal_store().with_template("bad_args.yaml", BAD_ARGS);
        let mut config = minimal_config();
        config.controller.sidecars.push(SidecarSpec::new("bad_args.yaml"));

        let err = generate(ClusterFlavor::Standalone, &config, &store).unwrap_err();

        match err.root() {
            EngineError::MergeTypeMismatch { path, .. } => {
                assert_eq!(path, "spec.template.spec.containers[name=csi-driver].image");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_metrics_sidecars_get_consecutive_ports() {
        let mut config = minimal_config();
        config.controller.sidecar_local_metrics_port_start = 9100;
        config.controller.sidecar_exposed_metrics_port_start = 19100;
        config.controller.sidecars = vec![
            SidecarSpec::new("resizer.yaml").with_metrics("resizer-m"),
            SidecarSpec::new("snapshotter.yaml").with_metrics("snapshotter-m"),
        ];
        let store = minimal_store()
            .with_template("snapshotter.yaml", SNAPSHOTTER)
            .with_template("common/sidecars/sidecar_kube_rbac_proxy.yaml", RBAC_PROXY);

        let bundle = generate(ClusterFlavor::Standalone, &config, &store).unwrap();
        let deployment = asset(&bundle, Side::Controller, "controller.yaml");

        assert_eq!(
            args(container(&deployment, "resizer-m-kube-rbac-proxy")),
            vec!["--listen=19100", "--upstream=9100"]
        );
        assert_eq!(
            args(container(&deployment, "snapshotter-m-kube-rbac-proxy")),
            vec!["--listen=19101", "--upstream=9101"]
        );

        let monitor = asset(&bundle, Side::Controller, "controller_metrics_servicemonitor.yaml");
        let ports: Vec<_> = monitor["spec"]["endpoints"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|e| e["port"].as_str().unwrap())
            .collect();
        assert_eq!(ports, vec!["resizer-m", "snapshotter-m"]);
    }

    #[test]
    fn test_port_overflow() {
        let mut config = minimal_config();
        config.controller.sidecar_local_metrics_port_start = 65535;
        config.controller.sidecar_exposed_metrics_port_start = 9000;
        config.controller.sidecars = vec![
            SidecarSpec::new("resizer.yaml").with_metrics("resizer-m"),
            SidecarSpec::new("resizer.yaml").with_metrics("resizer-m"),
        ];
        let store = minimal_store()
            .with_template("common/sidecars/sidecar_kube_rbac_proxy.yaml", RBAC_PROXY);

        let err = generate(ClusterFlavor::Standalone, &config, &store).unwrap_err();

        assert!(matches!(err.root(), EngineError::PortOutOfRange { port: 65536 }));
    }

    #[test]
    fn test_guest_sidecar_metrics_are_rejected() {
        let mut config = minimal_config();
        config
            .guest
            .sidecars
            .push(SidecarSpec::new("resizer.yaml").with_metrics("resizer-m"));

        let err = generate(ClusterFlavor::Standalone, &config, &minimal_store()).unwrap_err();

        assert!(matches!(
            err.root(),
            EngineError::GuestSidecarMetrics { template } if template == "resizer.yaml"
        ));
        assert_eq!(
            err.to_string(),
            "guest asset 'node.yaml': guest sidecar 'resizer.yaml' declares a metrics port"
        );
    }
}
