// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! Wires one sync pipeline per repository onto a face and serves the
//! global endpoints (`create-project`, `init-server`, `add-user`).

use std::{
    cell::RefCell,
    collections::BTreeMap,
    rc::Rc,
    time::Duration,
};

use log::{
    info,
    warn,
};

use crate::{
    account::{
        cert_name_ids,
        Accounts,
    },
    cfg::Cfg,
    git::{
        GitRepo,
        GitRepos,
    },
    handler::Handler,
    keys::EcdsaSigner,
    ndn::{
        face,
        Data,
        Face,
        Interest,
        Reply,
    },
    sync::{
        packet::AddUserReq,
        ObjectFetcher,
        RepoSyncPipeline,
        VSync,
    },
};

const SUCCEEDED: &[u8] = b"SUCCEEDED";
const FAILED: &[u8] = b"FAILED";
const REPLY_FRESHNESS: Duration = Duration::from_secs(10);

struct RepoUnit {
    pipeline: Rc<RepoSyncPipeline>,
    _vsync: Rc<VSync>,
    _fetcher: Rc<ObjectFetcher>,
    _handler: Rc<Handler>,
}

pub struct Server {
    face: Rc<dyn Face>,
    cfg: Cfg,
    repos: Rc<GitRepos>,
    accounts: Rc<Accounts>,
    signer: Rc<EcdsaSigner>,
    units: RefCell<BTreeMap<String, RepoUnit>>,
}

impl Server {
    pub fn new(face: Rc<dyn Face>, cfg: Cfg) -> crate::Result<Rc<Self>> {
        let signer = Rc::new(EcdsaSigner::load(&cfg.keystore, &cfg.key)?);
        let repos = GitRepos::open(cfg.base_dir.join("git"))?;
        let accounts = Accounts::new(Rc::clone(&repos));
        accounts.read_trust_anchor(&cfg.trust_anchor)?;

        let this = Rc::new(Self {
            face,
            cfg,
            repos,
            accounts,
            signer,
            units: RefCell::new(BTreeMap::new()),
        });
        for (name, repo) in this.repos.all() {
            let unit = this.init_repo_unit(&name, repo);
            this.units.borrow_mut().insert(name, unit);
        }
        Ok(this)
    }

    pub fn repos(&self) -> Rc<GitRepos> {
        Rc::clone(&self.repos)
    }

    /// Create a repository and start serving it.
    pub fn add_repo(&self, name: &str) -> crate::Result<()> {
        let repo = self.repos.create_repo(name)?;
        let unit = self.init_repo_unit(name, repo);
        self.units.borrow_mut().insert(name.to_owned(), unit);
        Ok(())
    }

    /// Announce a repository's current ref heads to the peers.
    ///
    /// The pipelines announce on their own after applying updates; this
    /// is for refs mutated out-of-band.
    pub fn announce(&self, repo: &str) -> crate::Result<()> {
        match self.units.borrow().get(repo) {
            Some(unit) => unit.pipeline.send_sync_update(None),
            None => Err(crate::error::NotFound {
                what: repo.to_owned(),
                whence: "this server".to_owned(),
            }
            .into()),
        }
    }

    /// Register the global endpoints and announce all repositories.
    pub fn start(self: Rc<Self>) -> crate::Result<()> {
        let create = Rc::clone(&self);
        self.face.register(
            self.cfg.endpoint("create-project"),
            face::handler(move |interest: Interest| {
                let this = Rc::clone(&create);
                async move { this.create_project(interest) }
            }),
        );
        let init = Rc::clone(&self);
        self.face.register(
            self.cfg.endpoint("init-server"),
            face::handler(move |interest: Interest| {
                let this = Rc::clone(&init);
                async move { this.init_server(interest) }
            }),
        );
        let add = Rc::clone(&self);
        self.face.register(
            self.cfg.endpoint("add-user"),
            face::handler(move |interest: Interest| {
                let this = Rc::clone(&add);
                async move { this.add_user(interest) }
            }),
        );

        for unit in self.units.borrow().values() {
            unit.pipeline.send_sync_update(None)?;
        }
        Ok(())
    }

    fn init_repo_unit(&self, name: &str, repo: Rc<GitRepo>) -> RepoUnit {
        let fetcher = ObjectFetcher::new(
            Rc::clone(&self.face),
            Rc::clone(&repo),
            self.cfg.objects_prefix(name),
        );
        let pipeline = RepoSyncPipeline::new(
            Rc::clone(&fetcher),
            Rc::clone(&repo),
            Rc::clone(&self.accounts),
        );

        // TODO: honor the sync_interval of the project config record
        let on_update = {
            let pipeline = Rc::clone(&pipeline);
            Rc::new(move |param: &[u8], digest| {
                Rc::clone(&pipeline).on_update(param, digest)
            })
        };
        let vsync = VSync::new(
            Rc::clone(&self.face),
            self.cfg.sync_prefix(name),
            crate::sync::vsync::DEFAULT_INTERVAL,
            on_update,
        );
        pipeline.set_transport(Rc::clone(&vsync));
        tokio::task::spawn_local(Rc::clone(&vsync).run());

        let handler = Handler::new(
            Rc::clone(&self.face),
            self.cfg.project_prefix(name),
            repo,
            Rc::clone(&pipeline),
            Rc::clone(&fetcher),
        );

        info!("Start sync on repo: {}", name);
        RepoUnit {
            pipeline,
            _vsync: vsync,
            _fetcher: fetcher,
            _handler: handler,
        }
    }

    fn create_project(&self, interest: Interest) -> Option<Reply> {
        let name = interest
            .app_param
            .as_deref()
            .and_then(|param| core::str::from_utf8(param).ok())?
            .to_owned();
        info!("Create repo: {} ...", name);

        let content = match self.add_repo(&name) {
            Ok(()) => SUCCEEDED,
            Err(e) => {
                warn!("Unable to create repo {}: {:#}", name, e);
                FAILED
            },
        };
        Some(Reply::new(interest.name, content.to_vec()).with_freshness(REPLY_FRESHNESS))
    }

    fn init_server(&self, interest: Interest) -> Option<Reply> {
        let outcome = self
            .accounts
            .trust_anchor_identity()
            .ok_or_else(|| crate::Error::msg("no trust anchor"))
            .and_then(|(user, key, cert)| {
                self.repos.init_server(&self.signer, &user, &key, &cert)
            });
        let content = match outcome {
            Ok(true) => SUCCEEDED,
            Ok(false) => {
                info!("Server is already initialized");
                FAILED
            },
            Err(e) => {
                warn!("Unable to initialize server: {:#}", e);
                FAILED
            },
        };
        Some(Reply::new(interest.name, content.to_vec()).with_freshness(REPLY_FRESHNESS))
    }

    fn add_user(&self, interest: Interest) -> Option<Reply> {
        let req = match interest.app_param.as_deref().map(AddUserReq::parse) {
            Some(Ok(req)) if !req.cert.is_empty() => req,
            _ => {
                warn!("Invalid add user request {}", interest.name);
                return None;
            },
        };

        let content = match add_user(&self.repos, &self.signer, &req) {
            Ok(true) => SUCCEEDED,
            Ok(false) | Err(_) => FAILED,
        };
        Some(Reply::new(interest.name, content.to_vec()).with_freshness(REPLY_FRESHNESS))
    }
}

fn add_user(
    repos: &GitRepos,
    signer: &EcdsaSigner,
    req: &AddUserReq,
) -> crate::Result<bool> {
    let cert = match Data::parse(&req.cert) {
        Ok(cert) => cert,
        Err(e) => {
            warn!("Certificate of new user is malformed: {}", e);
            return Ok(false);
        },
    };
    let (user_id, key_id) = match cert_name_ids(&cert.name) {
        Some(ids) => ids,
        None => {
            warn!("{} is not a certificate name", cert.name);
            return Ok(false);
        },
    };
    repos.add_account(
        signer,
        &user_id,
        &key_id,
        &req.cert,
        &req.full_name,
        &req.email,
    )
}
