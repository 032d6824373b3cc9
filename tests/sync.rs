// Copyright © 2022 Kim Altintop <kim@eagain.io>
// SPDX-License-Identifier: GPL-2.0-only WITH openvpn-openssl-exception

//! Two daemons on one in-memory hub, driven through the same request
//! surface real peers use.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    rc::Rc,
    time::Duration,
};

use p256::{
    ecdsa::SigningKey,
    pkcs8::{
        EncodePrivateKey,
        LineEnding,
    },
};
use tempfile::TempDir;

use gitsync::{
    git::{
        commit,
        tree,
        GitRepo,
        Refname,
        ALL_PROJECTS,
        ALL_USERS,
    },
    keys::EcdsaSigner,
    ndn::{
        data::signed_certificate,
        face::{
            self,
            Hub,
            MemFace,
        },
        Component,
        Face,
        Interest,
        Name,
        Reply,
    },
    sync::{
        fetch::{
            ObjectFetcher,
            SEGMENT_SIZE,
        },
        packet::{
            AddUserReq,
            PushRequest,
            RefInfo,
            SyncObject,
        },
    },
    Cfg,
    Server,
};

const PREFIX: &str = "/unit/git-ndn";
const ADMIN_KEY: &str = "/unit/git-ndn/users/admin/KEY/%01";

struct World {
    hub: Hub,
    keystore: PathBuf,
    anchor: PathBuf,
    admin: EcdsaSigner,
    _keys: TempDir,
}

fn world() -> World {
    let keys = tempfile::tempdir().unwrap();
    let sk = SigningKey::random(&mut rand_core::OsRng);
    let pem = sk.to_pkcs8_pem(LineEnding::LF).unwrap();
    fs::write(keys.path().join("01.key"), pem.as_bytes()).unwrap();
    let admin = EcdsaSigner::load(keys.path(), &ADMIN_KEY.parse().unwrap()).unwrap();

    let cert = signed_certificate(
        format!("{}/self/t=1", ADMIN_KEY).parse().unwrap(),
        &admin.public_key_der().unwrap(),
        Duration::from_secs(3600),
        &admin,
    )
    .unwrap();
    let anchor = keys.path().join("anchor.cert");
    fs::write(&anchor, &cert).unwrap();

    World {
        hub: Hub::new(),
        keystore: keys.path().to_owned(),
        anchor,
        admin,
        _keys: keys,
    }
}

struct Peer {
    server: Rc<Server>,
    _dir: TempDir,
}

impl Peer {
    fn new(w: &World) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Cfg {
            base_dir: dir.path().to_owned(),
            prefix: PREFIX.parse().unwrap(),
            keystore: w.keystore.clone(),
            key: ADMIN_KEY.parse().unwrap(),
            trust_anchor: w.anchor.clone(),
        };
        let server = Server::new(w.hub.face(), cfg).unwrap();
        Rc::clone(&server).start().unwrap();
        Self { server, _dir: dir }
    }

    fn repo(&self, name: &str) -> Rc<GitRepo> {
        self.server.repos().get(name).unwrap()
    }

    fn head(&self, repo: &str, name: &str) -> Option<git2::Oid> {
        self.repo(repo).get_head(&r(name)).unwrap()
    }
}

fn r(name: &str) -> Refname {
    name.parse().unwrap()
}

fn project_prefix(repo: &str) -> Name {
    format!("{}/project/{}", PREFIX, repo).parse().unwrap()
}

async fn tick() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

async fn settle() {
    for _ in 0..5 {
        tick().await;
    }
}

fn store_commit(
    repo: &GitRepo,
    tree: git2::Oid,
    parents: &[git2::Oid],
    msg: &str,
) -> git2::Oid {
    repo.store_obj(git2::ObjectType::Commit, &commit_bytes(tree, parents, msg))
        .unwrap()
}

fn commit_bytes(tree: git2::Oid, parents: &[git2::Oid], msg: &str) -> Vec<u8> {
    let mut s = format!("tree {}\n", tree);
    for p in parents {
        s.push_str(&format!("parent {}\n", p));
    }
    s.push_str("author gitsync <gitsync@localhost> 0 +0000\n");
    s.push_str("committer gitsync <gitsync@localhost> 0 +0000\n\n");
    s.push_str(msg);
    s.push('\n');
    s.into_bytes()
}

/// Commit `path = content` on top of `branch`, preserving the rest of
/// the tree, and advance the branch.
fn append_file(repo: &GitRepo, branch: &Refname, path: &str, content: &[u8]) -> git2::Oid {
    let head = repo.get_head(branch).unwrap().unwrap();
    let (_, root_bytes) = {
        let root = repo.tree_of(head).unwrap();
        repo.read_obj(root).unwrap()
    };
    let mut root = tree::parse(&root_bytes).unwrap();
    let blob = repo.store_obj(git2::ObjectType::Blob, content).unwrap();

    match path.split_once('/') {
        None => {
            root.insert(path.as_bytes().to_vec(), tree::Entry::blob(blob));
        },
        Some((dir, file)) => {
            let mut sub = match root.get(dir.as_bytes()) {
                Some(entry) => {
                    let (_, bytes) = repo.read_obj(entry.oid).unwrap();
                    tree::parse(&bytes).unwrap()
                },
                None => tree::Entries::new(),
            };
            sub.insert(file.as_bytes().to_vec(), tree::Entry::blob(blob));
            let sub_oid = repo
                .store_obj(git2::ObjectType::Tree, &tree::encode(&sub))
                .unwrap();
            root.insert(dir.as_bytes().to_vec(), tree::Entry::tree(sub_oid));
        },
    }

    let root_oid = repo
        .store_obj(git2::ObjectType::Tree, &tree::encode(&root))
        .unwrap();
    let new = store_commit(repo, root_oid, &[head], path);
    repo.set_head(branch, new).unwrap();
    new
}

/// A pushing client: a local repository served under the objects prefix,
/// the way the git-remote helper operates.
struct Client {
    repo: Rc<GitRepo>,
    face: Rc<MemFace>,
    _fetcher: Rc<ObjectFetcher>,
    _dir: TempDir,
}

impl Client {
    fn new(w: &World, repo_name: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Rc::new(GitRepo::create(dir.path(), repo_name).unwrap());
        let face = w.hub.face();
        let fetcher = ObjectFetcher::new(
            Rc::clone(&face) as Rc<dyn Face>,
            Rc::clone(&repo),
            project_prefix(repo_name).append(Component::from_bytes("objects")),
        );
        Self {
            repo,
            face,
            _fetcher: fetcher,
            _dir: dir,
        }
    }

    /// One commit of one tree of one blob, stored locally.
    fn sample_commit(&self, content: &[u8]) -> git2::Oid {
        let blob = self
            .repo
            .store_obj(git2::ObjectType::Blob, content)
            .unwrap();
        let mut entries = tree::Entries::new();
        entries.insert(b"README".to_vec(), tree::Entry::blob(blob));
        let tree = self
            .repo
            .store_obj(git2::ObjectType::Tree, &tree::encode(&entries))
            .unwrap();
        store_commit(&self.repo, tree, &[], "sample")
    }

    async fn push(
        &self,
        repo_name: &str,
        name: &str,
        head: git2::Oid,
        force: bool,
    ) -> String {
        let request = PushRequest {
            ref_info: RefInfo {
                ref_name: name.as_bytes().to_vec(),
                ref_head: head,
            },
            force,
        };
        let interest =
            Interest::new(project_prefix(repo_name).append(Component::from_bytes("push")))
                .with_param(request.encode())
                .with_lifetime(Duration::from_secs(60));
        let reply = self.face.express(interest).await.unwrap();
        String::from_utf8(reply.content).unwrap()
    }
}

async fn express(w: &World, name: Name, param: Option<Vec<u8>>) -> String {
    let face = w.hub.face();
    let mut interest = Interest::new(name);
    if let Some(param) = param {
        interest = interest.with_param(param);
    }
    let reply = face.express(interest).await.unwrap();
    String::from_utf8(reply.content).unwrap()
}

/// Initialize peer `a` and register the user `alice`, returning her
/// signer.
async fn bootstrap(w: &World) -> EcdsaSigner {
    let endpoint: Name = format!("{}/init-server", PREFIX).parse().unwrap();
    assert_eq!(express(w, endpoint, None).await, "SUCCEEDED");

    let alice = EcdsaSigner::generate("/unit/git-ndn/users/alice/KEY/%02".parse().unwrap());
    let cert = signed_certificate(
        "/unit/git-ndn/users/alice/KEY/%02/admin/t=2".parse().unwrap(),
        &alice.public_key_der().unwrap(),
        Duration::from_secs(3600),
        &w.admin,
    )
    .unwrap();
    let req = AddUserReq {
        full_name: b"Alice".to_vec(),
        email: b"alice@example.com".to_vec(),
        cert,
    };
    let endpoint: Name = format!("{}/add-user", PREFIX).parse().unwrap();
    assert_eq!(express(w, endpoint, Some(req.encode())).await, "SUCCEEDED");

    alice
}

#[tokio::test(start_paused = true)]
async fn new_branch_converges_on_empty_store() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let w = world();
            let a = Peer::new(&w);
            let b = Peer::new(&w);

            let client = Client::new(&w, ALL_PROJECTS);
            let c1 = client.sample_commit(b"hello");
            let reply = client.push(ALL_PROJECTS, "refs/heads/main", c1, false).await;
            assert_eq!(reply, "SUCCEEDED");
            settle().await;

            assert_eq!(a.head(ALL_PROJECTS, "refs/heads/main"), Some(c1));
            assert_eq!(b.head(ALL_PROJECTS, "refs/heads/main"), Some(c1));

            // the full closure was fetched
            let repo = b.repo(ALL_PROJECTS);
            let links = commit::links(&repo.read_obj(c1).unwrap().1).unwrap();
            let tree_oid = links.tree.unwrap();
            assert!(repo.has_obj(tree_oid).unwrap());
            let entries = tree::parse(&repo.read_obj(tree_oid).unwrap().1).unwrap();
            for entry in entries.values() {
                assert!(repo.has_obj(entry.oid).unwrap());
            }

            // and ref-list reports the new head
            let listing = express(
                &w,
                project_prefix(ALL_PROJECTS).append(Component::from_bytes("ref-list")),
                None,
            )
            .await;
            assert!(listing.contains(&format!("{} refs/heads/main", c1)));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn non_descendant_is_rejected() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let w = world();
            let a = Peer::new(&w);
            let b = Peer::new(&w);

            let client = Client::new(&w, ALL_PROJECTS);
            let c1 = client.sample_commit(b"one");
            client.push(ALL_PROJECTS, "refs/heads/main", c1, false).await;
            settle().await;
            assert_eq!(b.head(ALL_PROJECTS, "refs/heads/main"), Some(c1));

            // an unrelated root commit appears on b
            let unrelated = {
                let repo = b.repo(ALL_PROJECTS);
                let blob = repo.store_obj(git2::ObjectType::Blob, b"two").unwrap();
                let mut entries = tree::Entries::new();
                entries.insert(b"README".to_vec(), tree::Entry::blob(blob));
                let tree = repo
                    .store_obj(git2::ObjectType::Tree, &tree::encode(&entries))
                    .unwrap();
                let c2 = store_commit(&repo, tree, &[], "unrelated");
                repo.set_head(&r("refs/heads/main"), c2).unwrap();
                c2
            };
            b.server.announce(ALL_PROJECTS).unwrap();
            settle().await;

            // no common base and not a mergeable class: a keeps its head
            assert_eq!(a.head(ALL_PROJECTS, "refs/heads/main"), Some(c1));
            assert_eq!(b.head(ALL_PROJECTS, "refs/heads/main"), Some(unrelated));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn user_branches_merge_append_only() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let w = world();
            let a = Peer::new(&w);
            let b = Peer::new(&w);

            let _alice = bootstrap(&w).await;
            a.server.announce(ALL_USERS).unwrap();
            settle().await;

            let branch = r("refs/users/al/alice");
            let base = b.head(ALL_USERS, "refs/users/al/alice").expect("alice replicated");
            assert_eq!(a.head(ALL_USERS, "refs/users/al/alice"), Some(base));

            // both sides add a key independently
            let k3 = EcdsaSigner::generate("/unit/git-ndn/users/alice/KEY/%03".parse().unwrap());
            let cert3 = signed_certificate(
                "/unit/git-ndn/users/alice/KEY/%03/admin/t=3".parse().unwrap(),
                &k3.public_key_der().unwrap(),
                Duration::from_secs(3600),
                &w.admin,
            )
            .unwrap();
            let k4 = EcdsaSigner::generate("/unit/git-ndn/users/alice/KEY/%04".parse().unwrap());
            let cert4 = signed_certificate(
                "/unit/git-ndn/users/alice/KEY/%04/admin/t=4".parse().unwrap(),
                &k4.public_key_der().unwrap(),
                Duration::from_secs(3600),
                &w.admin,
            )
            .unwrap();

            let ca = append_file(&a.repo(ALL_USERS), &branch, "KEY/03.cert", &cert3);
            let cb = append_file(&b.repo(ALL_USERS), &branch, "KEY/04.cert", &cert4);
            a.server.announce(ALL_USERS).unwrap();
            b.server.announce(ALL_USERS).unwrap();

            let mut converged = None;
            for _ in 0..20 {
                tick().await;
                let ha = a.head(ALL_USERS, "refs/users/al/alice");
                if ha.is_some() && ha == b.head(ALL_USERS, "refs/users/al/alice") {
                    converged = ha;
                    break;
                }
            }
            let head = converged.expect("peers converged");

            // the merge commit joins both heads
            let repo = a.repo(ALL_USERS);
            let links = commit::links(&repo.read_obj(head).unwrap().1).unwrap();
            let mut parents = links.parents.clone();
            parents.sort();
            let mut expected = vec![ca, cb];
            expected.sort();
            assert_eq!(parents, expected);

            // and its tree is the union of both additions
            let root = tree::parse(&repo.read_obj(links.tree.unwrap()).unwrap().1).unwrap();
            let keys = tree::parse(
                &repo
                    .read_obj(root.get(b"KEY".as_slice()).unwrap().oid)
                    .unwrap()
                    .1,
            )
            .unwrap();
            let names: Vec<_> = keys.keys().cloned().collect();
            assert_eq!(
                names,
                vec![
                    b"02.cert".to_vec(),
                    b"03.cert".to_vec(),
                    b"04.cert".to_vec()
                ]
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn signature_failure_stops_the_walk() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let w = world();
            let a = Peer::new(&w);
            let b = Peer::new(&w);

            let _alice = bootstrap(&w).await;
            a.server.announce(ALL_USERS).unwrap();
            settle().await;
            let branch = r("refs/users/al/alice");
            assert!(b.head(ALL_USERS, "refs/users/al/alice").is_some());

            let repo = a.repo(ALL_USERS);

            // c1: a valid new certificate
            let k3 = EcdsaSigner::generate("/unit/git-ndn/users/alice/KEY/%03".parse().unwrap());
            let cert3 = signed_certificate(
                "/unit/git-ndn/users/alice/KEY/%03/admin/t=3".parse().unwrap(),
                &k3.public_key_der().unwrap(),
                Duration::from_secs(3600),
                &w.admin,
            )
            .unwrap();
            let c1 = append_file(&repo, &branch, "KEY/03.cert", &cert3);

            // c2: the account record with a flipped signature bit
            let mut account = repo.read_file(&branch, "account.tlv").unwrap();
            let len = account.len();
            account[len - 1] ^= 1;
            let _c2 = append_file(&repo, &branch, "account.tlv", &account);

            // c3: another valid certificate on top
            let k5 = EcdsaSigner::generate("/unit/git-ndn/users/alice/KEY/%05".parse().unwrap());
            let cert5 = signed_certificate(
                "/unit/git-ndn/users/alice/KEY/%05/admin/t=5".parse().unwrap(),
                &k5.public_key_der().unwrap(),
                Duration::from_secs(3600),
                &w.admin,
            )
            .unwrap();
            let _c3 = append_file(&repo, &branch, "KEY/05.cert", &cert5);

            a.server.announce(ALL_USERS).unwrap();
            settle().await;

            // the walk stops at the last verified commit
            assert_eq!(b.head(ALL_USERS, "refs/users/al/alice"), Some(c1));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn immutable_branches_never_change() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let w = world();
            let a = Peer::new(&w);
            let b = Peer::new(&w);

            let client = Client::new(&w, ALL_PROJECTS);
            let cx = client.sample_commit(b"patch set 1");
            let reply = client
                .push(ALL_PROJECTS, "refs/changes/aa/ab/1", cx, false)
                .await;
            assert_eq!(reply, "SUCCEEDED");
            settle().await;
            assert_eq!(b.head(ALL_PROJECTS, "refs/changes/aa/ab/1"), Some(cx));

            // b moves the immutable ref to a descendant and announces
            let cy = append_file(&b.repo(ALL_PROJECTS), &r("refs/changes/aa/ab/1"), "extra", b"y");
            b.server.announce(ALL_PROJECTS).unwrap();
            settle().await;

            assert_eq!(a.head(ALL_PROJECTS, "refs/changes/aa/ab/1"), Some(cx));
            assert_eq!(b.head(ALL_PROJECTS, "refs/changes/aa/ab/1"), Some(cy));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn slow_push_goes_pending_then_succeeds() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let w = world();
            let a = Peer::new(&w);
            let _b = Peer::new(&w);

            // hand-rolled objects, served with a 3s delay per segment
            let blob = b"pending".to_vec();
            let blob_oid = git2::Oid::hash_object(git2::ObjectType::Blob, &blob).unwrap();
            let mut entries = tree::Entries::new();
            entries.insert(b"README".to_vec(), tree::Entry::blob(blob_oid));
            let tree_bytes = tree::encode(&entries);
            let tree_oid = git2::Oid::hash_object(git2::ObjectType::Tree, &tree_bytes).unwrap();
            let commit_data = commit_bytes(tree_oid, &[], "pending");
            let commit_oid =
                git2::Oid::hash_object(git2::ObjectType::Commit, &commit_data).unwrap();

            let mut objects = HashMap::new();
            objects.insert(blob_oid.as_bytes().to_vec(), ("blob", blob));
            objects.insert(tree_oid.as_bytes().to_vec(), ("tree", tree_bytes));
            objects.insert(commit_oid.as_bytes().to_vec(), ("commit", commit_data));
            let objects = Rc::new(objects);

            let slow = w.hub.face();
            slow.register(
                project_prefix(ALL_PROJECTS).append(Component::from_bytes("objects")),
                face::handler(move |interest: Interest| {
                    let objects = Rc::clone(&objects);
                    async move {
                        tokio::time::sleep(Duration::from_secs(3)).await;
                        let name = &interest.name;
                        let (hash, seg) = match name.from_end(1)? {
                            c if c.is_segment() => (name.from_end(2)?, c.to_number()),
                            c => (c, 0),
                        };
                        let (kind, data) = objects.get(hash.value())?;
                        let start = (seg as usize * SEGMENT_SIZE).min(data.len());
                        let end = (start + SEGMENT_SIZE).min(data.len());
                        let pack = SyncObject {
                            obj_type: kind.as_bytes().to_vec(),
                            obj_data: data[start..end].to_vec(),
                        };
                        let final_block =
                            (data.len() + SEGMENT_SIZE - 1) / SEGMENT_SIZE;
                        Some(
                            Reply::new(interest.name.clone(), pack.encode())
                                .with_final_block(Component::from_segment(final_block as u64)),
                        )
                    }
                }),
            );

            // six segment fetches at 3s each exceed half of a 16s
            // lifetime
            let request = PushRequest {
                ref_info: RefInfo {
                    ref_name: b"refs/heads/main".to_vec(),
                    ref_head: commit_oid,
                },
                force: false,
            };
            let push_name =
                project_prefix(ALL_PROJECTS).append(Component::from_bytes("push"));
            let interest = Interest::new(push_name.clone())
                .with_param(request.encode())
                .with_lifetime(Duration::from_secs(16));
            let reply = slow.express(interest).await.unwrap();
            assert_eq!(reply.content, b"PENDING");
            assert_eq!(a.head(ALL_PROJECTS, "refs/heads/main"), None);

            // the task finishes out-of-band
            tokio::time::sleep(Duration::from_secs(30)).await;
            assert_eq!(a.head(ALL_PROJECTS, "refs/heads/main"), Some(commit_oid));

            // re-issuing the same push is idempotent and settles in time
            let interest = Interest::new(push_name)
                .with_param(request.encode())
                .with_lifetime(Duration::from_secs(16));
            let reply = slow.express(interest).await.unwrap();
            assert_eq!(reply.content, b"SUCCEEDED");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn refetching_performs_no_network_io() {
    use std::cell::Cell;

    struct CountingFace {
        inner: Rc<MemFace>,
        count: Rc<Cell<usize>>,
    }

    #[async_trait::async_trait(?Send)]
    impl Face for CountingFace {
        async fn express(
            &self,
            interest: Interest,
        ) -> Result<Reply, face::error::Expressed> {
            self.count.set(self.count.get() + 1);
            self.inner.express(interest).await
        }

        fn register(&self, prefix: Name, handler: face::Handler) {
            self.inner.register(prefix, handler)
        }

        fn unregister(&self, prefix: &Name) {
            self.inner.unregister(prefix)
        }
    }

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let w = world();

            let src = Client::new(&w, "demo.git");
            let head = src.sample_commit(b"dedup");

            let dir = tempfile::tempdir().unwrap();
            let repo = Rc::new(GitRepo::create(dir.path(), "demo.git").unwrap());
            let count = Rc::new(Cell::new(0));
            let face = Rc::new(CountingFace {
                inner: w.hub.face(),
                count: Rc::clone(&count),
            });
            let fetcher = ObjectFetcher::new(
                face,
                Rc::clone(&repo),
                project_prefix("demo.git").append(Component::from_bytes("objects")),
            );

            fetcher
                .fetch(Some(git2::ObjectType::Commit), head)
                .await
                .unwrap();
            assert!(repo.has_obj(head).unwrap());
            let fetched = count.get();
            assert!(fetched > 0);

            fetcher
                .fetch(Some(git2::ObjectType::Commit), head)
                .await
                .unwrap();
            assert_eq!(count.get(), fetched);
        })
        .await;
}
