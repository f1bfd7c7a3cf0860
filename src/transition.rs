use bevy::prelude::*;

/// Camera move between two views, advanced once per tick.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewTransition {
    pub from_eye: Vec3,
    pub from_target: Vec3,
    pub to_eye: Vec3,
    pub to_target: Vec3,
    pub duration: f32,
    elapsed: f32,
}

fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

impl ViewTransition {
    pub fn new(from: (Vec3, Vec3), to: (Vec3, Vec3), duration: f32) -> Self {
        Self {
            from_eye: from.0,
            from_target: from.1,
            to_eye: to.0,
            to_target: to.1,
            duration: duration.max(0.0),
            elapsed: 0.0,
        }
    }

    pub fn progress(&self) -> f32 {
        if self.duration <= f32::EPSILON {
            return 1.0;
        }
        (self.elapsed / self.duration).clamp(0.0, 1.0)
    }

    pub fn is_finished(&self) -> bool {
        self.progress() >= 1.0
    }

    /// Advances by `dt` seconds and returns the interpolated `(eye, target)`.
    pub fn advance(&mut self, dt: f32) -> (Vec3, Vec3) {
        self.elapsed = (self.elapsed + dt.max(0.0)).min(self.duration.max(0.0));
        let t = smoothstep(self.progress());
        (
            self.from_eye.lerp(self.to_eye, t),
            self.from_target.lerp(self.to_target, t),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_tracks_progress_and_lands_on_target() {
        let mut transition = ViewTransition::new(
            (Vec3::ZERO, Vec3::Z),
            (Vec3::new(10.0, 0.0, 0.0), Vec3::X),
            1.0,
        );
        let (eye, _) = transition.advance(0.5);
        assert!((eye.x - 5.0).abs() < 1e-4);
        assert!(!transition.is_finished());
        assert!((transition.progress() - 0.5).abs() < 1e-6);

        let (eye, target) = transition.advance(2.0);
        assert_eq!(eye, Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(target, Vec3::X);
        assert!(transition.is_finished());
    }

    #[test]
    fn zero_duration_jumps_immediately() {
        let mut transition = ViewTransition::new((Vec3::ZERO, Vec3::ZERO), (Vec3::Y, Vec3::Y), 0.0);
        assert_eq!(transition.advance(0.0), (Vec3::Y, Vec3::Y));
    }
}
