//! Example exercise set demonstrating the schema.
//!
//! Three enabled exercises in progression order, plus one disabled draft
//! that progression must skip.

use crate::exercise::{Difficulty, Exercise, ScriptSource};
use crate::id::ExerciseId;

/// Returns the canonical example exercises.
#[must_use]
pub fn example_exercises() -> Vec<Exercise> {
    let stopped_nginx = Exercise::new(
        ExerciseId::new(1),
        "nginx is down",
        10,
        ScriptSource::inline(
            "#!/bin/sh\nsystemctl stop nginx\nsystemctl mask nginx\n",
        ),
        ScriptSource::inline("#!/bin/sh\nsystemctl is-active --quiet nginx\n"),
    )
    .with_body("The web server stopped answering on port 80. Bring it back.")
    .with_hints([
        "Is the nginx unit running? Ask systemctl.",
        "A masked unit cannot be started until it is unmasked.",
    ])
    .with_difficulty(Difficulty::Easy);

    let full_disk = Exercise::new(
        ExerciseId::new(2),
        "disk full",
        20,
        ScriptSource::inline(
            "#!/bin/sh\nfallocate -l \"$(df --output=avail -B1 /var | tail -1)\" /var/tmp/.ballast || true\n",
        ),
        ScriptSource::inline(
            "#!/bin/sh\n[ \"$(df --output=pcent /var | tail -1 | tr -dc 0-9)\" -lt 90 ]\n",
        ),
    )
    .with_body("Writes to /var are failing. Find out why and free space.")
    .with_hints([
        "`df -h` shows which filesystem is full.",
        "Look for large hidden files under /var/tmp.",
    ]);

    let draft = Exercise::new(
        ExerciseId::new(3),
        "broken DNS (draft)",
        25,
        ScriptSource::path("/opt/breakfix/faults/dns.sh"),
        ScriptSource::path("/opt/breakfix/checks/dns.sh"),
    )
    .with_enabled(false);

    let ssh_perms = Exercise::new(
        ExerciseId::new(4),
        "sshd refuses keys",
        30,
        ScriptSource::path("/opt/breakfix/faults/ssh-perms.sh"),
        ScriptSource::path("/opt/breakfix/checks/ssh-perms.sh"),
    )
    .with_body("Key-based logins for the `ops` user stopped working.")
    .with_difficulty(Difficulty::Hard);

    vec![stopped_nginx, full_disk, draft, ssh_perms]
}
