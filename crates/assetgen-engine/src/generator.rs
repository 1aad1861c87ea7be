//! Asset generator: builds controller and guest manifests of a CSI driver
//!
//! Both sides go through the same stages:
//!
//! 1. load the base workload (Deployment / DaemonSet) and apply the
//!    driver's workload template
//! 2. inject the kube-rbac-proxy in front of the driver metrics port
//! 3. inject every sidecar, in order, allocating metrics ports
//! 4. build the metrics Service and ServiceMonitor
//! 5. collect the static assets of the active flavor
//! 6. apply the flavor-gated asset patches
//!
//! Any error aborts the whole run; no partial bundle is ever returned.

use assetgen_core::{
    AssetPatchSpec, ClusterFlavor, DriverConfig, PlaceholderTable, SidecarSpec, StaticAsset,
    TemplateStore, asset_base_name,
};
use indexmap::IndexMap;
use std::collections::BTreeMap;

use crate::bundle::{
    CONTROLLER_DEPLOYMENT_ASSET, CONTROLLER_METRICS_SERVICE_ASSET,
    CONTROLLER_METRICS_SERVICE_MONITOR_ASSET, GeneratedAssetBundle, NODE_DAEMONSET_ASSET,
    NODE_METRICS_SERVICE_ASSET, NODE_METRICS_SERVICE_MONITOR_ASSET, NODE_RBAC_PROXY_BINDING_ASSET,
    NODE_RBAC_PROXY_ROLE_ASSET, Side,
};
use crate::document::{AnnotatedDocument, RenderOptions};
use crate::error::{EngineError, Result};
use crate::merge::MergeOptions;
use crate::patch::PatchEngine;
use crate::sidecar::{SidecarInjection, add_sidecar};

const LOCAL_METRICS_PORT: &str = "${LOCAL_METRICS_PORT}";
const EXPOSED_METRICS_PORT: &str = "${EXPOSED_METRICS_PORT}";
const PORT_NAME: &str = "${PORT_NAME}";
const SERVICE_PREFIX: &str = "${SERVICE_PREFIX}";
const LIVENESS_PROBE_PORT: &str = "${LIVENESS_PROBE_PORT}";
const NODE_DRIVER_REGISTRAR_HEALTH_PORT: &str = "${NODE_DRIVER_REGISTRAR_HEALTH_PORT}";

/// Metrics port name of the driver itself
const DRIVER_PORT_NAME: &str = "driver-m";

type AssetMap = IndexMap<String, AnnotatedDocument>;

/// Generate all assets of a driver for one flavor
pub fn generate(
    flavor: ClusterFlavor,
    config: &DriverConfig,
    store: &dyn TemplateStore,
) -> Result<GeneratedAssetBundle> {
    AssetGenerator::new(flavor, config, store).generate()
}

/// Hands out metrics port pairs to sidecars, in declaration order
#[derive(Debug, Clone)]
struct PortAllocator {
    local: u32,
    exposed: u32,
}

impl PortAllocator {
    fn new(local_start: u16, exposed_start: u16) -> Self {
        Self {
            local: local_start.into(),
            exposed: exposed_start.into(),
        }
    }

    fn next(&mut self) -> Result<(u16, u16)> {
        let local = u16::try_from(self.local)
            .map_err(|_| EngineError::PortOutOfRange { port: self.local })?;
        let exposed = u16::try_from(self.exposed)
            .map_err(|_| EngineError::PortOutOfRange { port: self.exposed })?;
        self.local += 1;
        self.exposed += 1;
        Ok((local, exposed))
    }
}

/// Generator of one driver's assets for one flavor
pub struct AssetGenerator<'a> {
    flavor: ClusterFlavor,
    config: &'a DriverConfig,
    engine: PatchEngine<'a>,
    render: RenderOptions,
}

impl<'a> AssetGenerator<'a> {
    pub fn new(
        flavor: ClusterFlavor,
        config: &'a DriverConfig,
        store: &'a dyn TemplateStore,
    ) -> Self {
        Self {
            flavor,
            config,
            engine: PatchEngine::new(store, config.global_replacements()),
            render: RenderOptions::default(),
        }
    }

    pub fn with_render_options(mut self, render: RenderOptions) -> Self {
        self.render = render;
        self
    }

    pub fn with_merge_options(mut self, merge: MergeOptions) -> Self {
        self.engine = self.engine.with_merge_options(merge);
        self
    }

    /// Run both pipelines and render the result
    pub fn generate(&self) -> Result<GeneratedAssetBundle> {
        tracing::debug!(
            flavor = %self.flavor,
            driver = %self.config.driver_name,
            "generating assets"
        );

        let controller = self.generate_controller()?;
        let guest = self.generate_guest()?;

        let bundle = GeneratedAssetBundle {
            controller: self.render_side(Side::Controller, &controller)?,
            guest: self.render_side(Side::Guest, &guest)?,
        };

        for unresolved in bundle.unresolved_placeholders() {
            tracing::warn!(
                side = %unresolved.side,
                asset = %unresolved.asset,
                token = %unresolved.token,
                "unresolved placeholder in generated asset"
            );
        }
        Ok(bundle)
    }

    fn render_side(
        &self,
        side: Side,
        assets: &AssetMap,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut rendered = BTreeMap::new();
        for (name, doc) in assets {
            let bytes = doc
                .render_with(&self.render)
                .map_err(|e| e.in_asset(side, name))?;
            rendered.insert(name.clone(), bytes);
        }
        Ok(rendered)
    }

    // =========================================================================
    // Controller side
    // =========================================================================

    fn generate_controller(&self) -> Result<AssetMap> {
        let mut assets = AssetMap::new();
        let side = Side::Controller;

        let deployment = self
            .generate_deployment()
            .map_err(|e| e.in_asset(side, CONTROLLER_DEPLOYMENT_ASSET))?;
        assets.insert(CONTROLLER_DEPLOYMENT_ASSET.to_string(), deployment);

        self.generate_controller_monitoring(&mut assets)?;
        self.collect_static_assets(side, &self.config.controller.assets, &mut assets)?;
        self.patch_assets(side, &self.config.controller.asset_patches, &mut assets)?;
        Ok(assets)
    }

    fn generate_deployment(&self) -> Result<AnnotatedDocument> {
        let cfg = &self.config.controller;
        let layout = &self.config.layout;

        let mut base = PlaceholderTable::new();
        if cfg.liveness_probe_port > 0 {
            base = base.with(LIVENESS_PROBE_PORT, cfg.liveness_probe_port);
        }

        let mut deployment = self.engine.load(&layout.controller_base, &PlaceholderTable::new())?;
        self.engine
            .apply_patch(&mut deployment, &cfg.deployment_template, &base)?;

        self.add_driver_proxy(
            &mut deployment,
            &layout.controller_driver_proxy,
            cfg.local_metrics_port,
            cfg.exposed_metrics_port,
            &base,
        )?;

        let mut ports = PortAllocator::new(
            cfg.sidecar_local_metrics_port_start,
            cfg.sidecar_exposed_metrics_port_start,
        );
        for sidecar in &cfg.sidecars {
            let mut replacements = base.clone();
            if sidecar.has_metrics_port {
                let (local, exposed) = ports.next()?;
                replacements = replacements
                    .with(LOCAL_METRICS_PORT, local)
                    .with(EXPOSED_METRICS_PORT, exposed)
                    .with(PORT_NAME, &sidecar.metric_port_name);
            }
            self.inject(&mut deployment, sidecar, replacements, true)?;
        }

        Ok(deployment)
    }

    fn generate_controller_monitoring(&self, assets: &mut AssetMap) -> Result<()> {
        let cfg = &self.config.controller;
        let layout = &self.config.layout;
        let side = Side::Controller;

        let mut service = self
            .engine
            .load(&layout.controller_metrics_service, &PlaceholderTable::new())
            .map_err(|e| e.in_asset(side, CONTROLLER_METRICS_SERVICE_ASSET))?;
        let mut monitor = self
            .engine
            .load(&layout.controller_metrics_service_monitor, &PlaceholderTable::new())
            .map_err(|e| e.in_asset(side, CONTROLLER_METRICS_SERVICE_MONITOR_ASSET))?;
        let mut metrics = MetricsAssets {
            side,
            service: &mut service,
            service_name: CONTROLLER_METRICS_SERVICE_ASSET,
            monitor: &mut monitor,
            monitor_name: CONTROLLER_METRICS_SERVICE_MONITOR_ASSET,
            prefix: "controller",
        };

        let mut ports = PortAllocator::new(
            cfg.sidecar_local_metrics_port_start,
            cfg.sidecar_exposed_metrics_port_start,
        );
        for sidecar in cfg.sidecars.iter().filter(|s| s.has_metrics_port) {
            let (local, exposed) = ports
                .next()
                .map_err(|e| e.in_asset(side, CONTROLLER_METRICS_SERVICE_ASSET))?;
            self.add_metrics_port(&mut metrics, local, exposed, &sidecar.metric_port_name)?;
        }
        if cfg.local_metrics_port > 0 {
            self.add_metrics_port(
                &mut metrics,
                cfg.local_metrics_port,
                cfg.exposed_metrics_port,
                DRIVER_PORT_NAME,
            )?;
        }

        assets.insert(CONTROLLER_METRICS_SERVICE_ASSET.to_string(), service);
        if self.flavor.has_monitoring_rbac() {
            assets.insert(CONTROLLER_METRICS_SERVICE_MONITOR_ASSET.to_string(), monitor);
        } else {
            tracing::debug!(flavor = %self.flavor, "no monitoring RBAC, skipping ServiceMonitor");
        }
        Ok(())
    }

    // =========================================================================
    // Guest side
    // =========================================================================

    fn generate_guest(&self) -> Result<AssetMap> {
        let mut assets = AssetMap::new();
        let side = Side::Guest;

        let daemonset = self
            .generate_daemonset()
            .map_err(|e| e.in_asset(side, NODE_DAEMONSET_ASSET))?;
        assets.insert(NODE_DAEMONSET_ASSET.to_string(), daemonset);

        self.generate_guest_monitoring(&mut assets)?;
        self.collect_static_assets(side, &self.config.guest.assets, &mut assets)?;
        self.collect_controller_guest_assets(&mut assets)?;
        self.patch_assets(side, &self.config.guest.asset_patches, &mut assets)?;
        Ok(assets)
    }

    fn generate_daemonset(&self) -> Result<AnnotatedDocument> {
        let cfg = &self.config.guest;
        let layout = &self.config.layout;

        let mut base = PlaceholderTable::new();
        if cfg.liveness_probe_port > 0 {
            base = base.with(LIVENESS_PROBE_PORT, cfg.liveness_probe_port);
        }
        if cfg.node_registrar_health_port > 0 {
            base = base.with(NODE_DRIVER_REGISTRAR_HEALTH_PORT, cfg.node_registrar_health_port);
        }

        let mut daemonset = self.engine.load(&layout.node_base, &PlaceholderTable::new())?;
        self.engine
            .apply_patch(&mut daemonset, &cfg.daemonset_template, &base)?;

        self.add_driver_proxy(
            &mut daemonset,
            &layout.node_driver_proxy,
            cfg.local_metrics_port,
            cfg.exposed_metrics_port,
            &base,
        )?;

        for sidecar in &cfg.sidecars {
            // there is no node metrics Service to expose a sidecar port on
            if sidecar.has_metrics_port {
                return Err(EngineError::GuestSidecarMetrics {
                    template: sidecar.template.clone(),
                });
            }
            self.inject(&mut daemonset, sidecar, base.clone(), false)?;
        }

        Ok(daemonset)
    }

    fn generate_guest_monitoring(&self, assets: &mut AssetMap) -> Result<()> {
        let cfg = &self.config.guest;
        let layout = &self.config.layout;
        let side = Side::Guest;

        // No node-level sidecar exports metrics, so without driver metrics
        // there is nothing to scrape.
        if cfg.local_metrics_port == 0 {
            return Ok(());
        }

        let mut service = self
            .engine
            .load(&layout.node_metrics_service, &PlaceholderTable::new())
            .map_err(|e| e.in_asset(side, NODE_METRICS_SERVICE_ASSET))?;
        let mut monitor = self
            .engine
            .load(&layout.node_metrics_service_monitor, &PlaceholderTable::new())
            .map_err(|e| e.in_asset(side, NODE_METRICS_SERVICE_MONITOR_ASSET))?;
        let mut metrics = MetricsAssets {
            side,
            service: &mut service,
            service_name: NODE_METRICS_SERVICE_ASSET,
            monitor: &mut monitor,
            monitor_name: NODE_METRICS_SERVICE_MONITOR_ASSET,
            prefix: "node",
        };
        self.add_metrics_port(
            &mut metrics,
            cfg.local_metrics_port,
            cfg.exposed_metrics_port,
            DRIVER_PORT_NAME,
        )?;

        assets.insert(NODE_METRICS_SERVICE_ASSET.to_string(), service);
        assets.insert(NODE_METRICS_SERVICE_MONITOR_ASSET.to_string(), monitor);

        for (asset, template) in [
            (NODE_RBAC_PROXY_ROLE_ASSET, &layout.node_rbac_proxy_role),
            (NODE_RBAC_PROXY_BINDING_ASSET, &layout.node_rbac_proxy_binding),
        ] {
            let doc = self
                .engine
                .load(template, &PlaceholderTable::new())
                .map_err(|e| e.in_asset(side, asset))?;
            assets.insert(asset.to_string(), doc);
        }
        Ok(())
    }

    /// Sidecars running in the controller may still need objects in the
    /// guest cluster, e.g. RBAC rules for the API they watch there.
    fn collect_controller_guest_assets(&self, assets: &mut AssetMap) -> Result<()> {
        for sidecar in &self.config.controller.sidecars {
            for template in &sidecar.guest_assets {
                let asset = asset_base_name(template);
                let mut doc = self
                    .engine
                    .load(template, &PlaceholderTable::new())
                    .map_err(|e| e.in_asset(Side::Guest, asset))?;
                doc.record(format!(
                    "  because it's needed by controller sidecar {}",
                    sidecar.template
                ));
                assets.insert(asset.to_string(), doc);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Shared stages
    // =========================================================================

    /// Put kube-rbac-proxy in front of the driver's own metrics port
    fn add_driver_proxy(
        &self,
        workload: &mut AnnotatedDocument,
        proxy_patch: &str,
        local_port: u16,
        exposed_port: u16,
        base: &PlaceholderTable,
    ) -> Result<()> {
        if local_port == 0 {
            return Ok(());
        }
        let replacements = base
            .with(LOCAL_METRICS_PORT, local_port)
            .with(EXPOSED_METRICS_PORT, exposed_port);
        self.engine.apply_patch(workload, proxy_patch, &replacements)
    }

    fn inject(
        &self,
        workload: &mut AnnotatedDocument,
        sidecar: &SidecarSpec,
        replacements: PlaceholderTable,
        with_metrics_proxy: bool,
    ) -> Result<()> {
        let metrics_proxy = (with_metrics_proxy && sidecar.has_metrics_port)
            .then_some(self.config.layout.sidecar_proxy.as_str());
        add_sidecar(
            &self.engine,
            workload,
            &SidecarInjection {
                template: &sidecar.template,
                replacements,
                extra_args: &sidecar.extra_args,
                metrics_proxy,
                flavor: self.flavor,
                patches: &sidecar.patches,
            },
        )
    }

    /// Add one port to the metrics Service and one endpoint to the ServiceMonitor
    fn add_metrics_port(
        &self,
        metrics: &mut MetricsAssets<'_>,
        local_port: u16,
        exposed_port: u16,
        port_name: &str,
    ) -> Result<()> {
        let layout = &self.config.layout;
        let replacements = PlaceholderTable::new()
            .with(LOCAL_METRICS_PORT, local_port)
            .with(EXPOSED_METRICS_PORT, exposed_port)
            .with(PORT_NAME, port_name)
            .with(SERVICE_PREFIX, metrics.prefix);

        self.engine
            .apply_patch(metrics.service, &layout.service_port_patch, &replacements)
            .map_err(|e| e.in_asset(metrics.side, metrics.service_name))?;
        self.engine
            .apply_patch(
                metrics.monitor,
                &layout.service_monitor_port_patch,
                &replacements,
            )
            .map_err(|e| e.in_asset(metrics.side, metrics.monitor_name))
    }

    fn collect_static_assets(
        &self,
        side: Side,
        entries: &[StaticAsset],
        assets: &mut AssetMap,
    ) -> Result<()> {
        for entry in entries.iter().filter(|a| a.cluster_flavors.has(self.flavor)) {
            let doc = self
                .engine
                .load(&entry.name, &PlaceholderTable::new())
                .map_err(|e| e.in_asset(side, entry.asset_name()))?;
            assets.insert(entry.asset_name().to_string(), doc);
        }
        Ok(())
    }

    fn patch_assets(
        &self,
        side: Side,
        patches: &[AssetPatchSpec],
        assets: &mut AssetMap,
    ) -> Result<()> {
        for spec in patches.iter().filter(|p| p.cluster_flavors.has(self.flavor)) {
            let Some(doc) = assets.get_mut(&spec.asset) else {
                return Err(EngineError::AssetNotFoundForPatch {
                    asset: spec.asset.clone(),
                    patch: spec.patch.clone(),
                }
                .in_asset(side, &spec.asset));
            };
            self.engine
                .apply_patch(doc, &spec.patch, &PlaceholderTable::new())
                .map_err(|e| e.in_asset(side, &spec.asset))?;
        }
        Ok(())
    }
}

/// The metrics Service / ServiceMonitor pair of one side
struct MetricsAssets<'d> {
    side: Side,
    service: &'d mut AnnotatedDocument,
    service_name: &'static str,
    monitor: &'d mut AnnotatedDocument,
    monitor_name: &'static str,
    prefix: &'static str,
}
